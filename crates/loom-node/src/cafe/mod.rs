//! Both sides of the cafe protocol.
//!
//! [`CafeClient`] registers this node with remote cafes and issues the
//! authenticated requests the cafe outbox and inbox need. [`CafeHost`]
//! answers those requests when this node serves as a cafe.

mod client;
mod host;

pub use client::{CafeClient, ThreadBackup};
pub use host::{CafeHost, CafeHostConfig};
