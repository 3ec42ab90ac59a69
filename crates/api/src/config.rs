//! Server-level configuration.
//!
//! Covers everything outside the points domain: bind address, database
//! and Redis URLs, and the internal bearer token. The points-domain
//! snapshot lives in [`qalam_shared::PointsConfig`].

use qalam_shared::ConfigError;

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub bind_address: String,
    pub database_url: String,
    /// Direct (non-pooler) URL for migrations; PgBouncer rejects the
    /// prepared statements the migrator uses.
    pub database_direct_url: Option<String>,
    /// Redis backing for velocity counters. Absent means in-memory,
    /// per-instance counters.
    pub redis_url: Option<String>,
    /// Bearer token guarding the internal, queue, and admin routes.
    pub internal_api_token: String,
}

impl ApiConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| ConfigError::MissingVar("DATABASE_URL"))?;
        let internal_api_token = std::env::var("INTERNAL_API_TOKEN")
            .map_err(|_| ConfigError::MissingVar("INTERNAL_API_TOKEN"))?;
        if internal_api_token.len() < 16 {
            return Err(ConfigError::InvalidVar {
                var: "INTERNAL_API_TOKEN",
                detail: "must be at least 16 characters".into(),
            });
        }

        Ok(Self {
            bind_address: std::env::var("BIND_ADDRESS")
                .unwrap_or_else(|_| "0.0.0.0:8080".into()),
            database_url,
            database_direct_url: std::env::var("DATABASE_DIRECT_URL").ok(),
            redis_url: std::env::var("REDIS_URL").ok(),
            internal_api_token,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[serial_test::serial]
    fn from_env_requires_core_vars() {
        std::env::remove_var("DATABASE_URL");
        std::env::remove_var("INTERNAL_API_TOKEN");
        assert!(matches!(
            ApiConfig::from_env(),
            Err(ConfigError::MissingVar("DATABASE_URL"))
        ));

        std::env::set_var("DATABASE_URL", "postgres://localhost/qalam");
        assert!(matches!(
            ApiConfig::from_env(),
            Err(ConfigError::MissingVar("INTERNAL_API_TOKEN"))
        ));

        std::env::set_var("INTERNAL_API_TOKEN", "short");
        assert!(matches!(
            ApiConfig::from_env(),
            Err(ConfigError::InvalidVar { .. })
        ));

        std::env::set_var("INTERNAL_API_TOKEN", "long-enough-internal-token");
        let config = ApiConfig::from_env().unwrap();
        assert_eq!(config.bind_address, "0.0.0.0:8080");
        assert!(config.redis_url.is_none());

        std::env::remove_var("DATABASE_URL");
        std::env::remove_var("INTERNAL_API_TOKEN");
    }
}
