use crate::error::{Error, Result};
use dotenvy::dotenv;
use std::env;
use std::sync::OnceLock;

#[derive(Debug, Clone)]
pub struct Config {
    pub server_address: String,
    pub database_url: Option<String>,
    pub jwt_secret: String,
    pub seb_signing_secret: String,
    pub seb_public_url: String,
    pub seb_token_ttl_secs: u64,
    pub heartbeat_timeout_secs: u64,
    pub heartbeat_max_missed: u32,
    pub monitor_tick_secs: u64,
    pub suspend_risk_threshold: u8,
    pub store_retry_limit: u32,
    pub attempt_cooldown_days: i64,
    pub result_delay_secs: i64,
    pub public_rps: u32,
    pub admin_rps: u32,
}

pub static CONFIG: OnceLock<Config> = OnceLock::new();

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        Ok(Self {
            server_address: get_env("SERVER_ADDRESS")?,
            database_url: env::var("DATABASE_URL").ok(),
            jwt_secret: get_env("JWT_SECRET")?,
            seb_signing_secret: get_env("SEB_SIGNING_SECRET")?,
            seb_public_url: get_env("SEB_PUBLIC_URL")?,
            seb_token_ttl_secs: get_env_or("SEB_TOKEN_TTL_SECS", 120)?,
            heartbeat_timeout_secs: get_env_or("HEARTBEAT_TIMEOUT_SECS", 30)?,
            heartbeat_max_missed: get_env_or("HEARTBEAT_MAX_MISSED", 3)?,
            monitor_tick_secs: get_env_or("MONITOR_TICK_SECS", 10)?,
            suspend_risk_threshold: get_env_or("SUSPEND_RISK_THRESHOLD", 70)?,
            store_retry_limit: get_env_or("STORE_RETRY_LIMIT", 3)?,
            attempt_cooldown_days: get_env_or("ATTEMPT_COOLDOWN_DAYS", 7)?,
            result_delay_secs: get_env_or("RESULT_DELAY_SECS", 3600)?,
            public_rps: get_env_or("PUBLIC_RPS", 50)?,
            admin_rps: get_env_or("ADMIN_RPS", 20)?,
        })
    }
}

fn get_env(name: &str) -> Result<String> {
    env::var(name).map_err(|_| Error::Config(format!("Missing environment variable: {}", name)))
}

fn get_env_or<T>(name: &str, default: T) -> Result<T>
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

pub fn init_config() -> Result<()> {
    let config = Config::from_env()?;
    CONFIG
        .set(config)
        .map_err(|_| Error::Config("Configuration has already been initialized".to_string()))?;
    Ok(())
}

pub fn get_config() -> &'static Config {
    CONFIG
        .get()
        .expect("Configuration has not been initialized")
}
