//! Service wiring for the jobqueue binary: layered configuration and the
//! demo topic set.

#![warn(missing_docs)]

pub mod config;
pub mod demo;

pub use config::Config;
