//! Infrastructure layer: broker and store adapters, and the job services built on them.
//!
//! - [`queue::QueueManager`] submits jobs and mirrors them to the audit store.
//! - [`worker::WorkerPool`] runs registered handlers against queued jobs.
//! - [`dead_letter::DeadLetterService`] triages jobs whose attempts ran out.
//! - [`cron_scheduler::CronScheduler`] keeps named recurring triggers.

pub mod broker;
pub mod config;
pub mod cron_scheduler;
pub mod dead_letter;
pub mod queue;
pub mod side_effect;
pub mod store;
pub mod worker;
