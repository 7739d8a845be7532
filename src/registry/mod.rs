//! Subscription registry: which connections want which threads' events.
//!
//! All access funnels through [`SubscriptionRegistry`]; no component
//! touches its internals. Reads (one per broadcast) vastly outnumber
//! writes (subscribe/unsubscribe/disconnect), so state sits behind a
//! single reader-preferring lock rather than an exclusive one.

mod registry;
mod types;

pub use registry::SubscriptionRegistry;
pub use types::Subscription;
