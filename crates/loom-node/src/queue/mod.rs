//! Durable delivery queues.
//!
//! Every queue is a table in the datastore drained in batches of
//! [`QUEUE_BATCH_SIZE`](loom_shared::constants::QUEUE_BATCH_SIZE) by a
//! single flusher at a time. Items are removed only once handled, so a
//! crash between send and delete means a redelivery, never a loss.

mod block_outbox;
mod cafe_inbox;
mod cafe_outbox;

pub use block_outbox::BlockOutbox;
pub use cafe_inbox::CafeInbox;
pub use cafe_outbox::CafeOutbox;
