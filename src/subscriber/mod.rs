//! Event subscriber: the single ordered path from the control plane's event
//! feed to everything that waits on device state.
//!
//! The subscriber keeps one connection alive (liveness pings, reconnect with
//! exponential backoff and jitter), numbers what it receives per connection,
//! detects gaps, and fans events out to listeners on unbounded queues. After
//! every reconnect and every gap it re-reads the entities listeners care about
//! and pushes the results through the same path as [`EnvelopeOrigin::Resync`]
//! envelopes, so a listener never has to special-case recovery.

mod backoff;
mod cache;
mod envelope;
mod stream;
mod worker;

pub use backoff::Backoff;
pub use cache::StateCache;
pub use envelope::{EntityFilter, EnvelopeOrigin, EventEnvelope, FeedHealth, FeedSignal, SubscriptionId};
pub use stream::Subscription;
pub use worker::{CallbackHandle, EventSubscriber};
