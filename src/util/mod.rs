//! Utility modules: configuration, errors, logging

pub mod config;
pub mod error;
pub mod logger;
