//! Webhook ingestion and durable job pipeline.
//!
//! Inbound platform webhooks are authenticated, persisted as webhook records,
//! and turned into jobs on a durable queue. Workers lease jobs, dispatch them
//! to the handler registered for the job type, and drive both the job and the
//! webhook record to a terminal state.

pub mod api;
pub mod config;
pub mod db;
pub mod jobs;
pub mod logging;
pub mod webhooks;
