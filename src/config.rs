use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{anyhow, Result};

use crate::rate_limit::RateLimitConfig;
use crate::repo::DEFAULT_LIKE_MAX_ATTEMPTS;

pub const DEFAULT_MAX_TEXT_LEN: usize = 2000;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub http_addr: SocketAddr,
    pub frontend_url: Option<String>,
    /// Snapshot directory of the in-memory store; unset means ephemeral.
    pub data_dir: Option<PathBuf>,
    pub database_url: Option<String>,
    pub like_max_attempts: u32,
    pub max_text_len: usize,
    pub rate_limit_enabled: bool,
    pub rate_limits: RateLimitConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let http_addr = env_or("HTTP_ADDR", "0.0.0.0:8080");
        let http_addr = SocketAddr::from_str(&http_addr).map_err(|err| anyhow!("invalid HTTP_ADDR: {}", err))?;

        let like_max_attempts: u32 = env_or_parse("LIKE_MAX_ATTEMPTS", &DEFAULT_LIKE_MAX_ATTEMPTS.to_string())?;
        if like_max_attempts == 0 {
            return Err(anyhow!("invalid LIKE_MAX_ATTEMPTS: must be at least 1"));
        }

        Ok(Self {
            http_addr,
            frontend_url: env_opt("FRONTEND_URL"),
            data_dir: env_opt("CINECHAT_DATA_DIR").map(PathBuf::from),
            database_url: env_opt("DATABASE_URL"),
            like_max_attempts,
            max_text_len: env_or_parse("MAX_TEXT_LEN", &DEFAULT_MAX_TEXT_LEN.to_string())?,
            rate_limit_enabled: env_or_parse("RATE_LIMIT_ENABLED", "true")?,
            rate_limits: RateLimitConfig::from_env(),
        })
    }

    pub fn snapshot_path(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|dir| dir.join("state.json"))
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_or_parse<T>(key: &str, default: &str) -> Result<T>
where
    T: FromStr,
    <T as FromStr>::Err: std::fmt::Display,
{
    let value = std::env::var(key).unwrap_or_else(|_| default.to_string());
    value
        .parse::<T>()
        .map_err(|err| anyhow!("invalid {}: {}", key, err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const KEYS: &[&str] = &[
        "HTTP_ADDR",
        "FRONTEND_URL",
        "CINECHAT_DATA_DIR",
        "DATABASE_URL",
        "LIKE_MAX_ATTEMPTS",
        "MAX_TEXT_LEN",
        "RATE_LIMIT_ENABLED",
        "RL_COMMENT_LIMIT",
    ];

    fn clear() {
        for key in KEYS {
            std::env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn defaults_apply_when_unset() {
        clear();
        let cfg = AppConfig::from_env().unwrap();
        assert_eq!(cfg.http_addr.port(), 8080);
        assert_eq!(cfg.like_max_attempts, DEFAULT_LIKE_MAX_ATTEMPTS);
        assert_eq!(cfg.max_text_len, DEFAULT_MAX_TEXT_LEN);
        assert!(cfg.rate_limit_enabled);
        assert!(cfg.snapshot_path().is_none());
        assert_eq!(cfg.rate_limits.comment_limit, 5);
    }

    #[test]
    #[serial]
    fn overrides_and_bad_values() {
        clear();
        std::env::set_var("CINECHAT_DATA_DIR", "/tmp/cinechat");
        std::env::set_var("RL_COMMENT_LIMIT", "2");
        let cfg = AppConfig::from_env().unwrap();
        assert_eq!(cfg.snapshot_path(), Some(PathBuf::from("/tmp/cinechat/state.json")));
        assert_eq!(cfg.rate_limits.comment_limit, 2);

        std::env::set_var("LIKE_MAX_ATTEMPTS", "0");
        assert!(AppConfig::from_env().is_err());
        std::env::set_var("LIKE_MAX_ATTEMPTS", "3");
        std::env::set_var("HTTP_ADDR", "not-an-addr");
        assert!(AppConfig::from_env().is_err());
        clear();
    }
}
