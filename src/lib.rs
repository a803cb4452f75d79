//! Entity infrastructure service.
//!
//! Ties the pure core ([`entity_infra_core`]) and the PostgreSQL adapter
//! ([`entity_infra_postgres`]) into one [`EntityService`], and supplies the
//! process plumbing around it: environment configuration, pool management
//! with migrations, and tracing setup.

pub mod config;
pub mod database;
pub mod service;
pub mod telemetry;

pub use config::{ConfigError, DatabaseConfig, InfraConfig};
pub use database::DatabaseManager;
pub use service::EntityService;

pub use entity_infra_core;
pub use entity_infra_postgres;
