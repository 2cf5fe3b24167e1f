//! Server configuration, read from the environment (and `.env` when present).

use std::net::SocketAddr;

use anyhow::{Context, Result};

pub const DEFAULT_DATABASE_URL: &str = "sqlite://pantrychat.db?mode=rwc";
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";
pub const DEFAULT_MAX_CONNECTIONS: u32 = 16;

#[derive(Debug, Clone)]
pub struct Config {
    /// `DATABASE_URL`
    pub database_url: String,
    /// `BIND_ADDR`
    pub bind_addr: SocketAddr,
    /// `API_TOKEN`; when set, every route but `/health` needs the bearer token
    pub api_token: Option<String>,
    /// `DB_MAX_CONNECTIONS`
    pub db_max_connections: u32,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| dotenv::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let database_url = lookup("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_owned());

        let bind_addr = lookup("BIND_ADDR")
            .unwrap_or_else(|| DEFAULT_BIND_ADDR.to_owned())
            .parse()
            .context("BIND_ADDR is not a socket address")?;

        let api_token = lookup("API_TOKEN").filter(|token| !token.is_empty());

        let db_max_connections = match lookup("DB_MAX_CONNECTIONS") {
            Some(value) => value
                .parse()
                .with_context(|| format!("DB_MAX_CONNECTIONS={value} is not a number"))?,
            None => DEFAULT_MAX_CONNECTIONS,
        };

        Ok(Config {
            database_url,
            bind_addr,
            api_token,
            db_max_connections,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_in(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let config = Config::from_lookup(lookup_in(&[])).unwrap();
        assert_eq!(config.database_url, DEFAULT_DATABASE_URL);
        assert_eq!(config.bind_addr.port(), 8080);
        assert_eq!(config.api_token, None);
        assert_eq!(config.db_max_connections, 16);
    }

    #[test]
    fn overrides() {
        let config = Config::from_lookup(lookup_in(&[
            ("DATABASE_URL", "sqlite::memory:"),
            ("BIND_ADDR", "127.0.0.1:9000"),
            ("API_TOKEN", "abc"),
            ("DB_MAX_CONNECTIONS", "4"),
        ]))
        .unwrap();
        assert_eq!(config.database_url, "sqlite::memory:");
        assert_eq!(config.bind_addr, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.api_token.as_deref(), Some("abc"));
        assert_eq!(config.db_max_connections, 4);
    }

    #[test]
    fn empty_token_means_open() {
        let config = Config::from_lookup(lookup_in(&[("API_TOKEN", "")])).unwrap();
        assert_eq!(config.api_token, None);
    }

    #[test]
    fn rejects_garbage() {
        assert!(Config::from_lookup(lookup_in(&[("BIND_ADDR", "nowhere")])).is_err());
        assert!(Config::from_lookup(lookup_in(&[("DB_MAX_CONNECTIONS", "lots")])).is_err());
    }
}
