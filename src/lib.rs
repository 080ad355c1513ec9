//! Audio Transcode Job Queue
//!
//! Durable, Redis-backed job processing for the soundboard backend: producers
//! enqueue `transcode` jobs over HTTP, worker processes claim them under a
//! lease, run the handler, and acknowledge the outcome with retry and
//! dead-letter semantics.

pub mod app_state;
pub mod config;
pub mod models;
pub mod routes;
pub mod services;
