use crate::error::{Error, Result};
use dotenvy::dotenv;
use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    pub server_address: String,
    /// Absent means rows live in process memory only.
    pub database_url: Option<String>,
    pub jwt_secret: String,
    pub export_dir: String,
    pub public_base_url: String,
    pub scheduler_interval_secs: u64,
    pub http_timeout_secs: u64,
    pub max_body_bytes: usize,
    /// Empty allows any origin.
    pub cors_origins: Vec<String>,
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_address: "127.0.0.1:8080".to_string(),
            database_url: None,
            jwt_secret: "change-me".to_string(),
            export_dir: "./exports".to_string(),
            public_base_url: "http://127.0.0.1:8080".to_string(),
            scheduler_interval_secs: 60,
            http_timeout_secs: 30,
            max_body_bytes: 10 * 1024 * 1024,
            cors_origins: Vec::new(),
            debug: false,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();
        let defaults = Config::default();

        Ok(Self {
            server_address: get_env_or("SERVER_ADDRESS", defaults.server_address),
            database_url: env::var("DATABASE_URL").ok().filter(|v| !v.is_empty()),
            jwt_secret: get_env("JWT_SECRET")?,
            export_dir: get_env_or("EXPORT_DIR", defaults.export_dir),
            public_base_url: get_env_or("PUBLIC_BASE_URL", defaults.public_base_url),
            scheduler_interval_secs: get_env_parse_or(
                "SCHEDULER_INTERVAL_SECS",
                defaults.scheduler_interval_secs,
            )?,
            http_timeout_secs: get_env_parse_or("HTTP_TIMEOUT_SECS", defaults.http_timeout_secs)?,
            max_body_bytes: get_env_parse_or("MAX_BODY_BYTES", defaults.max_body_bytes)?,
            cors_origins: env::var("CORS_ORIGINS")
                .map(|raw| {
                    raw.split(',')
                        .map(str::trim)
                        .filter(|o| !o.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            debug: get_env_parse_or("DEBUG", defaults.debug)?,
        })
    }
}

fn get_env(name: &str) -> Result<String> {
    env::var(name).map_err(|_| Error::Config(format!("Missing environment variable: {}", name)))
}

fn get_env_or(name: &str, default: String) -> String {
    env::var(name).unwrap_or(default)
}

fn get_env_parse_or<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| Error::Config(format!("Invalid value for {}: {}", name, e))),
        Err(_) => Ok(default),
    }
}
