//! Data layer module
//!
//! SQLite persistence for actors, relationship edges, statuses and polls,
//! plus the durable delivery and job queues.

mod database;
mod models;

pub use database::{
    AcceptOutcome, BlockApplied, BlockOutcome, Database, FollowOutcome, UndoOutcome,
};
pub use models::*;
