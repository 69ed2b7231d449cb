//! Core data models for the chunked upload service.
//!
//! File and ownership records map to database tables via `sqlx::FromRow`;
//! sessions are stored as JSON in the session cache.

pub mod content_hash;
pub mod file;
pub mod session;
pub mod upload;
