//! Data-access acceleration for the hospitality admin back office.
//!
//! A tiered cache, a request-coalescing loader, an offset pagination engine
//! and an operation monitor, assembled by [`application::Accelerator`].

pub mod application;
pub mod cache;
pub mod config;
pub mod infra;
pub mod monitor;
