//! Conveyor: a durable, Postgres-backed background job processor.
//!
//! Jobs are rows; the database is both the source of truth and the
//! coordination medium. Any number of nodes cooperate through
//! `FOR UPDATE SKIP LOCKED` leases, LISTEN/NOTIFY fan-out, and a
//! lease-based leader election, with no separate broker.

pub mod app;
pub mod cli;
pub mod config;
pub mod cron;
pub mod engine;
pub mod error;
pub mod events;
pub mod executor;
pub mod instance;
pub mod job;
pub mod logging;
pub mod notifier;
pub mod peer;
pub mod plugins;
pub mod queue;
pub mod registry;
pub mod services;
pub mod signals;
pub mod store;
pub mod utils;
pub mod worker;

pub use error::{Error, Result};
pub use instance::Conveyor;
pub use job::{Job, JobState, NewJob, UniqueOpts};
pub use worker::{Outcome, Worker};
