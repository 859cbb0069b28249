//! # loom-store
//!
//! Local persistence for a loom node, backed by SQLite.
//!
//! The crate exposes a synchronous [`Database`] handle wrapping a
//! `rusqlite::Connection` with typed CRUD helpers for threads, blocks,
//! contacts, invites, the three delivery queues, cafe sessions and the
//! tables a node needs when it hosts a cafe. [`Datastore`] is the cloneable,
//! lock-guarded handle shared between async tasks.

pub mod block_messages;
pub mod blocks;
pub mod cafe_clients;
pub mod cafe_messages;
pub mod cafe_requests;
pub mod cafe_sessions;
pub mod database;
pub mod invites;
pub mod migrations;
pub mod models;
pub mod peers;
pub mod threads;

mod error;
mod sql;

pub use database::{Database, Datastore};
pub use error::{Result, StoreError};
pub use models::*;
