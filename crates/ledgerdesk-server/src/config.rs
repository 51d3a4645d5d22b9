use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};

/// Placeholder JWT secrets that MUST NOT be used.
const PLACEHOLDER_SECRETS: &[&str] = &["change-me-to-a-random-string", "dev-secret-change-me"];

/// Server configuration, read from the environment (and `.env` if present).
#[derive(Debug, Clone)]
pub struct Config {
    pub jwt_secret: String,
    pub db_path: PathBuf,
    pub addr: SocketAddr,
    /// Allowed browser origin for CORS. `None` means any origin.
    pub cors_origin: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(get: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let jwt_secret = get("LEDGERDESK_JWT_SECRET").unwrap_or_default();
        if jwt_secret.is_empty() || PLACEHOLDER_SECRETS.contains(&jwt_secret.as_str()) {
            bail!("LEDGERDESK_JWT_SECRET is unset or still a placeholder");
        }

        let db_path = get("LEDGERDESK_DB_PATH")
            .unwrap_or_else(|| "ledgerdesk.db".into())
            .into();
        let host = get("LEDGERDESK_HOST").unwrap_or_else(|| "0.0.0.0".into());
        let port: u16 = get("LEDGERDESK_PORT")
            .unwrap_or_else(|| "3000".into())
            .parse()
            .context("LEDGERDESK_PORT is not a port number")?;
        let addr = format!("{}:{}", host, port)
            .parse()
            .with_context(|| format!("invalid listen address {}:{}", host, port))?;
        let cors_origin = get("LEDGERDESK_CORS_ORIGIN").filter(|o| !o.is_empty() && o != "*");

        Ok(Self {
            jwt_secret,
            db_path,
            addr,
            cors_origin,
        })
    }
}
