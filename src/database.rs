//! Pool construction and the bundled `entity_infra` schema.

use sqlx::migrate::{MigrateError, Migrator};
use sqlx::{postgres::PgPoolOptions, PgPool};
use tracing::{info, warn};

use crate::config::{mask_database_url, DatabaseConfig};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

pub struct DatabaseManager {
    pool: PgPool,
}

impl DatabaseManager {
    pub async fn new(config: &DatabaseConfig) -> Result<Self, sqlx::Error> {
        info!(
            url = %mask_database_url(&config.database_url),
            max_connections = config.max_connections,
            "Connecting to database"
        );

        let mut options = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.connection_timeout);
        if let Some(idle_timeout) = config.idle_timeout {
            options = options.idle_timeout(idle_timeout);
        }
        if let Some(max_lifetime) = config.max_lifetime {
            options = options.max_lifetime(max_lifetime);
        }

        let pool = options.connect(&config.database_url).await.map_err(|e| {
            warn!(error = %e, "Failed to connect to database");
            e
        })?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Brings the registry, link and permission tables up to date. Returns
    /// how many migrations the crate ships.
    pub async fn run_migrations(&self) -> Result<usize, MigrateError> {
        MIGRATOR.run(&self.pool).await?;
        let known = MIGRATOR.iter().count();
        info!(migrations = known, "Entity infrastructure schema is up to date");
        Ok(known)
    }
}
