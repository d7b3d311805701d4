//! HTTP API: job submission, progress and history queries, completion stream.

pub mod app;
pub mod config;
