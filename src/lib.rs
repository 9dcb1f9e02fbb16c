//! runtester library
//!
//! This library exposes the core modules for integration testing.
//! The binary entry point is in main.rs.

pub mod config;
pub mod coverage;
pub mod discovery;
pub mod dispatch;
pub mod environment;
pub mod errors;
pub mod events;
pub mod lifecycle;
pub mod logging;
pub mod reload;
pub mod reporter;
pub mod resolver;
pub mod signals;
pub mod snapshot;
pub mod suite;
pub mod watch;
pub mod xmlreport;
