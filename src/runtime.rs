//! Runtime glue that wires configuration, fatal error capture, the progress feed, telemetry and
//! the signal-aware runner.

pub mod config;
pub mod fatal;
pub mod progress;
pub mod runner;
pub mod telemetry;
