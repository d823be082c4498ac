//! Runtime bootstrap: telemetry and infrastructure errors.

pub mod error;
pub mod telemetry;
