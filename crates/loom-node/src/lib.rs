//! # loom-node
//!
//! A loom peer: encrypted append-only threads replicated between peers,
//! durable delivery queues, and the cafe protocol that lets offline peers
//! keep up through always-on hosts.

pub mod cafe;
pub mod config;
pub mod content;
pub mod error;
pub mod keys;
pub mod node;
pub mod queue;
pub mod service;
pub mod thread;
pub mod threads;

#[cfg(test)]
mod testing;

pub use config::NodeConfig;
pub use content::{ContentError, ContentStore, DiskContentStore, MemoryContentStore};
pub use error::{NodeError, Result};
pub use node::{Node, NodeOptions};
pub use thread::Thread;
pub use threads::{AddThreadConfig, Threads};
