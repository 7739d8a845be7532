//! Dual-path event dispatch.
//!
//! One accepted event fans out to two independent sinks: the durable store
//! and the broadcast router. The sinks never call each other and never
//! share failure state.

mod dispatcher;

pub use dispatcher::{DispatchOptions, Dispatcher};
