//! Configuration management for the gateway.

use serde::Deserialize;
use std::env;

/// Main configuration structure, resolved once at startup and handed to
/// component constructors as an explicit dependency.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub quota: QuotaConfig,
    pub routing: RoutingConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub cors_origins: Vec<String>,
    /// Seconds to wait for in-flight requests during graceful shutdown.
    pub shutdown_grace_seconds: u64,
    /// Secret used to sign session JWTs.
    pub jwt_secret: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    pub url: String,
}

/// Defaults for the async quota consumer (spec.md §4.3).
#[derive(Debug, Clone, Deserialize)]
pub struct QuotaConfig {
    pub channel_capacity: usize,
    pub workers: usize,
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
    /// Fudge factor applied to a whitespace-word-count token estimate when
    /// an upstream stream omits terminal usage.
    pub token_estimation_fudge_factor: f64,
}

/// Bounds on the router's retry/failover loop (spec.md §4.8 step 3).
#[derive(Debug, Clone, Deserialize)]
pub struct RoutingConfig {
    pub max_retries: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Config {
    /// Load configuration from defaults, an optional `config.toml`, and
    /// `TOLLGATE__`-prefixed environment variables (double underscore as
    /// the nested-key separator).
    pub fn load() -> Result<Self, config::ConfigError> {
        dotenvy::dotenv().ok();

        let raw = config::Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 3000)?
            .set_default("server.cors_origins", vec!["*"])?
            .set_default("server.shutdown_grace_seconds", 30)?
            .set_default("database.max_connections", 20)?
            .set_default("database.min_connections", 5)?
            .set_default("quota.channel_capacity", 1000)?
            .set_default("quota.workers", 3)?
            .set_default("quota.batch_size", 10)?
            .set_default("quota.flush_interval_ms", 5000)?
            .set_default("quota.retry_attempts", 3)?
            .set_default("quota.retry_delay_ms", 100)?
            .set_default("quota.token_estimation_fudge_factor", 1.3)?
            .set_default("routing.max_retries", 3)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "json")?
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("TOLLGATE").separator("__"))
            .build()?;

        Ok(Config {
            server: ServerConfig {
                host: raw.get("server.host").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: raw.get("server.port").unwrap_or(3000),
                cors_origins: raw
                    .get("server.cors_origins")
                    .unwrap_or_else(|_| vec!["*".to_string()]),
                shutdown_grace_seconds: raw.get("server.shutdown_grace_seconds").unwrap_or(30),
                jwt_secret: env::var("JWT_SECRET")
                    .unwrap_or_else(|_| "dev-insecure-jwt-secret-change-me".to_string()),
            },
            database: DatabaseConfig {
                url: env::var("DATABASE_URL")
                    .unwrap_or_else(|_| "postgresql://localhost/tollgate".to_string()),
                max_connections: raw.get("database.max_connections").unwrap_or(20),
                min_connections: raw.get("database.min_connections").unwrap_or(5),
            },
            redis: RedisConfig {
                url: env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            },
            quota: QuotaConfig {
                channel_capacity: raw.get("quota.channel_capacity").unwrap_or(1000),
                workers: raw.get("quota.workers").unwrap_or(3),
                batch_size: raw.get("quota.batch_size").unwrap_or(10),
                flush_interval_ms: raw.get("quota.flush_interval_ms").unwrap_or(5000),
                retry_attempts: raw.get("quota.retry_attempts").unwrap_or(3),
                retry_delay_ms: raw.get("quota.retry_delay_ms").unwrap_or(100),
                token_estimation_fudge_factor: raw
                    .get("quota.token_estimation_fudge_factor")
                    .unwrap_or(1.3),
            },
            routing: RoutingConfig {
                max_retries: raw.get("routing.max_retries").unwrap_or(3),
            },
            logging: LoggingConfig {
                level: raw.get("logging.level").unwrap_or_else(|_| "info".to_string()),
                format: raw.get("logging.format").unwrap_or_else(|_| "json".to_string()),
            },
        })
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults_load() {
        let config = Config::load();
        assert!(config.is_ok());
    }

    #[test]
    fn test_server_addr() {
        let config = Config::load().unwrap();
        assert!(config.server_addr().contains(':'));
    }
}
