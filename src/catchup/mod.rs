//! State reconstruction for (re)connecting subscribers.

mod service;

pub use service::{CatchupService, Replay};
