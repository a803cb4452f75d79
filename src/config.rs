//! Process configuration, read from the environment (and `.env` when present).

use std::time::Duration;

use entity_infra_core::{ResolverConfig, DEFAULT_ALL_INSTANCES_ID, MAX_PARENT_VIEW_DEPTH};
use uuid::Uuid;

pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost:5432/entity_infra";
pub const DEFAULT_PRIMARY_SCHEMA: &str = "app";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var}={value:?} is invalid: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    fn invalid(var: &'static str, value: &str, reason: impl ToString) -> Self {
        Self::Invalid {
            var,
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Database configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub connection_timeout: Duration,
    pub idle_timeout: Option<Duration>,
    pub max_lifetime: Option<Duration>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            max_connections: 10,
            connection_timeout: Duration::from_secs(30),
            idle_timeout: Some(Duration::from_secs(600)), // 10 minutes
            max_lifetime: Some(Duration::from_secs(1800)), // 30 minutes
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfraConfig {
    pub database: DatabaseConfig,
    pub resolver: ResolverConfig,
    /// Schema holding the business tables for the conventional accessor.
    pub primary_schema: String,
}

impl Default for InfraConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            resolver: ResolverConfig::default(),
            primary_schema: DEFAULT_PRIMARY_SCHEMA.to_string(),
        }
    }
}

impl InfraConfig {
    /// Loads `.env` if there is one, then reads the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Builds the configuration from any variable source. Unset variables take
    /// their default; set but unparseable ones are errors.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = lookup("DATABASE_URL") {
            url::Url::parse(&url)
                .map_err(|e| ConfigError::invalid("DATABASE_URL", &mask_database_url(&url), e))?;
            config.database.database_url = url;
        }
        if let Some(raw) = lookup("ENTITY_DB_POOL_SIZE") {
            config.database.max_connections = match raw.parse::<u32>() {
                Ok(size) if size > 0 => size,
                _ => {
                    return Err(ConfigError::invalid(
                        "ENTITY_DB_POOL_SIZE",
                        &raw,
                        "expected a positive integer",
                    ))
                }
            };
        }
        if let Some(raw) = lookup("ENTITY_DB_CONNECT_TIMEOUT_SECS") {
            let secs = raw.parse::<u64>().map_err(|e| {
                ConfigError::invalid("ENTITY_DB_CONNECT_TIMEOUT_SECS", &raw, e)
            })?;
            config.database.connection_timeout = Duration::from_secs(secs);
        }

        if let Some(raw) = lookup("ENTITY_PARENT_VIEW_DEPTH") {
            config.resolver.parent_view_depth = match raw.parse::<u8>() {
                Ok(depth) if depth <= MAX_PARENT_VIEW_DEPTH => depth,
                _ => {
                    return Err(ConfigError::invalid(
                        "ENTITY_PARENT_VIEW_DEPTH",
                        &raw,
                        format!("expected 0..={MAX_PARENT_VIEW_DEPTH}"),
                    ))
                }
            };
        }
        if let Some(raw) = lookup("ENTITY_ALL_INSTANCES_ID") {
            config.resolver.all_instances_id = Uuid::parse_str(&raw)
                .map_err(|e| ConfigError::invalid("ENTITY_ALL_INSTANCES_ID", &raw, e))?;
        }
        if let Some(code) = lookup("ENTITY_PRINCIPAL_TYPE") {
            config.resolver.principal_type = code;
        }
        if let Some(code) = lookup("ENTITY_ROLE_TYPE") {
            config.resolver.role_type = code;
        }
        config.resolver.validate().map_err(|e| {
            ConfigError::invalid("ENTITY_PRINCIPAL_TYPE/ENTITY_ROLE_TYPE", "", e)
        })?;

        if let Some(schema) = lookup("ENTITY_PRIMARY_SCHEMA") {
            entity_infra_core::validate_identifier("schema", &schema)
                .map_err(|e| ConfigError::invalid("ENTITY_PRIMARY_SCHEMA", &schema, e))?;
            config.primary_schema = schema;
        }

        Ok(config)
    }

    pub fn uses_default_sentinel(&self) -> bool {
        self.resolver.all_instances_id == DEFAULT_ALL_INSTANCES_ID
    }
}

/// Mask sensitive information in database URL for logging
pub fn mask_database_url(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("***"));
            }
            parsed.to_string()
        }
        Err(_) => "<unparseable database url>".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<InfraConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        InfraConfig::from_lookup(|var| vars.get(var).cloned())
    }

    #[test]
    fn empty_environment_gives_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config, InfraConfig::default());
        assert_eq!(config.database.database_url, DEFAULT_DATABASE_URL);
        assert_eq!(config.resolver.parent_view_depth, 1);
        assert!(config.uses_default_sentinel());
    }

    #[test]
    fn reads_every_variable() {
        let sentinel = "00000000-0000-0000-0000-000000000000";
        let config = load(&[
            ("DATABASE_URL", "postgresql://u:secret@db:5432/entities"),
            ("ENTITY_DB_POOL_SIZE", "4"),
            ("ENTITY_DB_CONNECT_TIMEOUT_SECS", "5"),
            ("ENTITY_PARENT_VIEW_DEPTH", "3"),
            ("ENTITY_ALL_INSTANCES_ID", sentinel),
            ("ENTITY_PRIMARY_SCHEMA", "crm"),
            ("ENTITY_PRINCIPAL_TYPE", "person"),
            ("ENTITY_ROLE_TYPE", "team"),
        ])
        .unwrap();
        assert_eq!(config.database.max_connections, 4);
        assert_eq!(config.database.connection_timeout, Duration::from_secs(5));
        assert_eq!(config.resolver.parent_view_depth, 3);
        assert_eq!(config.resolver.all_instances_id, Uuid::nil());
        assert_eq!(config.resolver.principal_type, "person");
        assert_eq!(config.resolver.role_type, "team");
        assert_eq!(config.primary_schema, "crm");
        assert!(!config.uses_default_sentinel());
    }

    #[test]
    fn invalid_values_are_errors() {
        assert!(load(&[("ENTITY_DB_POOL_SIZE", "0")]).is_err());
        assert!(load(&[("ENTITY_DB_POOL_SIZE", "many")]).is_err());
        assert!(load(&[("ENTITY_PARENT_VIEW_DEPTH", "9")]).is_err());
        assert!(load(&[("ENTITY_ALL_INSTANCES_ID", "all")]).is_err());
        assert!(load(&[("ENTITY_ROLE_TYPE", "Team")]).is_err());
        assert!(load(&[("ENTITY_PRIMARY_SCHEMA", "app; drop")]).is_err());
        assert!(load(&[("DATABASE_URL", "not a url")]).is_err());
    }

    #[test]
    fn masks_passwords() {
        assert_eq!(
            mask_database_url("postgresql://u:secret@db:5432/x"),
            "postgresql://u:***@db:5432/x"
        );
        assert_eq!(
            mask_database_url("postgresql://localhost:5432/x"),
            "postgresql://localhost:5432/x"
        );
    }

    proptest! {
        #[test]
        fn masked_url_never_contains_password(
            user in "[a-z]{1,8}",
            password in "P[0-9]{3}[A-Za-z0-9]{2,12}",
            host in "[a-z]{3,10}",
        ) {
            let masked = mask_database_url(&format!("postgresql://{user}:{password}@{host}:5432/app"));
            prop_assert!(!masked.contains(&password));
            prop_assert!(masked.contains(&host));
        }

        #[test]
        fn depth_above_bound_is_rejected(depth in (MAX_PARENT_VIEW_DEPTH + 1)..=u8::MAX) {
            let raw = depth.to_string();
            prop_assert!(load(&[("ENTITY_PARENT_VIEW_DEPTH", raw.as_str())]).is_err());
        }
    }
}
