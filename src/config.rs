//! Settings read from the environment (and a `.env` file, if present).

use std::env;
use std::net::SocketAddr;

use chrono::NaiveDate;
use log::warn;

use crate::error::{Result, TombolaError};

pub const DEFAULT_ARTICLE: &str = "Billet de tombola / Raffle ticket 2024";
pub const DEFAULT_MIN_DATE: &str = "2025-09-01";
const DEFAULT_DATABASE_URL: &str = "sqlite:tombola.db?mode=rwc";
const DEFAULT_BIND_ADDR: &str = "127.0.0.1:3000";
/// Server database settings that have no meaning for a SQLite file.
const SERVER_DATABASE_KEYS: [&str; 4] = ["DB_HOST", "DB_PORT", "DB_USER", "DB_PASSWORD"];

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_addr: SocketAddr,
    /// Shop article whose rows are tickets.
    pub article: String,
    /// Default lower bound offered by the upload form.
    pub min_date: Option<NaiveDate>,
    pub smtp: Option<SmtpConfig>,
    pub operator: Option<OperatorConfig>,
}

#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub sender: String,
    /// Real recipients only in production; otherwise mail is redirected.
    pub production: bool,
    pub test_recipient: Option<String>,
}

#[derive(Debug, Clone)]
pub struct OperatorConfig {
    pub user: String,
    pub password: OperatorPassword,
}

#[derive(Clone)]
pub enum OperatorPassword {
    /// Argon2 PHC string.
    Hash(String),
    Plain(String),
}

impl std::fmt::Debug for OperatorPassword {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperatorPassword::Hash(_) => f.write_str("Hash(..)"),
            OperatorPassword::Plain(_) => f.write_str("Plain(..)"),
        }
    }
}

impl Config {
    /// Load `.env` then build the configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        // A missing .env file is normal in production.
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the configuration from any key lookup; used with a map in tests.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let database_url = match (get("DATABASE_URL"), get("DB_NAME")) {
            (Some(url), _) => url,
            (None, Some(name)) => format!("sqlite:{}.db?mode=rwc", name),
            (None, None) => DEFAULT_DATABASE_URL.to_string(),
        };
        let ignored = ignored_database_keys(&get);
        if !ignored.is_empty() {
            warn!(
                "{} set but unused: orders are kept in {}",
                ignored.join(", "),
                database_url
            );
        }

        let bind_addr = get("BIND_ADDR")
            .unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string())
            .parse::<SocketAddr>()
            .map_err(|e| TombolaError::Config(format!("BIND_ADDR: {}", e)))?;

        let min_date = match get("TOMBOLA_MIN_DATE").as_deref() {
            Some("none") => None,
            Some(text) => Some(parse_day("TOMBOLA_MIN_DATE", text)?),
            None => Some(parse_day("TOMBOLA_MIN_DATE", DEFAULT_MIN_DATE)?),
        };

        let smtp = match get("SMTP_HOST") {
            Some(host) => {
                let port = match get("SMTP_PORT") {
                    Some(port) => port
                        .parse::<u16>()
                        .map_err(|e| TombolaError::Config(format!("SMTP_PORT: {}", e)))?,
                    None => 465,
                };
                let user = require(&get, "SMTP_USER")?;
                Some(SmtpConfig {
                    host,
                    port,
                    password: require(&get, "SMTP_PASSWORD")?,
                    sender: get("SENDER_EMAIL").unwrap_or_else(|| user.clone()),
                    user,
                    production: get("IS_PROD").is_some_and(|v| is_truthy(&v)),
                    test_recipient: get("TEST_RECIPIENT"),
                })
            }
            None => None,
        };

        let operator = match get("OPERATOR_USER") {
            Some(user) => {
                let password = match (get("OPERATOR_PASSWORD_HASH"), get("OPERATOR_PASSWORD")) {
                    (Some(hash), _) => OperatorPassword::Hash(hash),
                    (None, Some(plain)) => OperatorPassword::Plain(plain),
                    (None, None) => {
                        return Err(TombolaError::Config(
                            "OPERATOR_USER is set but neither OPERATOR_PASSWORD_HASH nor OPERATOR_PASSWORD"
                                .to_string(),
                        ));
                    }
                };
                Some(OperatorConfig { user, password })
            }
            None => None,
        };

        Ok(Config {
            database_url,
            bind_addr,
            article: get("TOMBOLA_ARTICLE").unwrap_or_else(|| DEFAULT_ARTICLE.to_string()),
            min_date,
            smtp,
            operator,
        })
    }
}

/// Server database keys present without a `DATABASE_URL` to go with them.
fn ignored_database_keys(get: &impl Fn(&str) -> Option<String>) -> Vec<&'static str> {
    if get("DATABASE_URL").is_some() {
        return Vec::new();
    }
    SERVER_DATABASE_KEYS
        .into_iter()
        .filter(|key| get(key).is_some())
        .collect()
}

fn require(get: &impl Fn(&str) -> Option<String>, key: &str) -> Result<String> {
    get(key).ok_or_else(|| TombolaError::Config(format!("missing environment variable {}", key)))
}

fn parse_day(key: &str, text: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .map_err(|e| TombolaError::Config(format!("{}: '{}' is not YYYY-MM-DD: {}", key, text, e)))
}

fn is_truthy(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes")
}
