//! Kronos - Sliding-Window Rate Limiting
//!
//! This crate bounds how often an operation (typically an outbound API call)
//! may run: at most `limit` admissions within any trailing time window. The
//! admission ledger can be shared by the threads of one process or, through
//! a locked ledger file, by independent processes.

pub mod config;
pub mod error;
pub mod logging;
pub mod ratelimit;
