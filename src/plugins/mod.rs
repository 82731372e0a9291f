//! Periodic plugins: staging, cron insertion, and orphan/prune sweeps.

mod cron;
mod lifeline;
mod stager;

pub use cron::CronPlugin;
pub use lifeline::{Lifeline, LifelineOptions};
pub use stager::Stager;
