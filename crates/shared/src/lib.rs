//! Shared configuration and value types for the Pagemint billing engine.
//!
//! This crate is dependency-light on purpose: both the engine crate and the
//! worker binary pull it in, and nothing here touches the database.

pub mod config;
pub mod types;

pub use config::{BillingConfig, CategoryCost, ConfigError};
pub use types::CreditPool;
