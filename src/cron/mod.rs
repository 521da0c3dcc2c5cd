//! Generic periodic-task scheduling primitive, reused by the Janitor (C8).

mod scheduler;

pub use scheduler::{Job, JobHandle, Scheduler, SchedulerError};
