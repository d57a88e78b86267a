use std::env;
use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};
use chrono::FixedOffset;
use dotenv::dotenv;

/// Server settings, read from the environment (and `.env` when present).
#[derive(Debug, Clone)]
pub struct Settings {
    pub database_url: String,
    pub jwt_secret: String,
    pub port: u16,
    pub public_base_url: String,
    pub frontend_origin: String,
    pub public_dir: PathBuf,
    pub google_client_id: Option<String>,
    pub utc_offset: FixedOffset,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("DATABASE_URL").context("DATABASE_URL env var must be set!")?;
        let jwt_secret = lookup("JWT_SECRET").context("JWT_SECRET env var must be set!")?;

        let port = match lookup("PORT") {
            Some(p) => p.parse::<u16>().context("PORT must be a valid port number")?,
            None => 4000,
        };

        let public_base_url = lookup("PUBLIC_BASE_URL")
            .unwrap_or_else(|| String::from("http://localhost:4000"))
            .trim_end_matches('/')
            .to_string();

        let frontend_origin = match lookup("FRONTEND_ORIGIN") {
            Some(raw) => parse_origin(&raw)
                .with_context(|| format!("FRONTEND_ORIGIN must look like scheme://host[:port], got {:?}", raw))?,
            None => String::from("http://localhost:5173"),
        };

        let public_dir = PathBuf::from(lookup("PUBLIC_DIR").unwrap_or_else(|| String::from("public")));

        let google_client_id = lookup("GOOGLE_CLIENT_ID").filter(|id| !id.trim().is_empty());

        let offset_minutes = match lookup("TIMECARD_UTC_OFFSET_MINUTES") {
            Some(m) => m
                .parse::<i32>()
                .context("TIMECARD_UTC_OFFSET_MINUTES must be an integer")?,
            None => 0,
        };
        let utc_offset = FixedOffset::east_opt(offset_minutes * 60)
            .ok_or_else(|| anyhow!("UTC offset out of range: {} minutes", offset_minutes))?;

        Ok(Settings {
            database_url,
            jwt_secret,
            port,
            public_base_url,
            frontend_origin,
            public_dir,
            google_client_id,
            utc_offset,
        })
    }

    pub fn uploads_dir(&self) -> PathBuf {
        self.public_dir.join("uploads")
    }
}

/// Normalizes a CORS origin to `scheme://host[:port]`, dropping a trailing slash.
fn parse_origin(raw: &str) -> Result<String> {
    let origin = raw.trim().trim_end_matches('/');
    let (scheme, authority) = origin
        .split_once("://")
        .ok_or_else(|| anyhow!("missing scheme"))?;

    if scheme.is_empty()
        || !scheme
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '.' | '-'))
    {
        bail!("invalid scheme");
    }

    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port)) => (host, Some(port)),
        None => (authority, None),
    };
    if host.is_empty()
        || !host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-'))
    {
        bail!("invalid host");
    }
    if let Some(port) = port {
        port.parse::<u16>().context("invalid port")?;
    }

    Ok(origin.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() -> Result<()> {
        let settings = Settings::from_lookup(lookup_from(&[
            ("DATABASE_URL", "sqlite://timecard.db"),
            ("JWT_SECRET", "shhh"),
        ]))?;

        assert_eq!(settings.port, 4000);
        assert_eq!(settings.public_base_url, "http://localhost:4000");
        assert_eq!(settings.frontend_origin, "http://localhost:5173");
        assert_eq!(settings.uploads_dir(), PathBuf::from("public/uploads"));
        assert!(settings.google_client_id.is_none());
        assert_eq!(settings.utc_offset.local_minus_utc(), 0);

        Ok(())
    }

    #[test]
    fn test_overrides() -> Result<()> {
        let settings = Settings::from_lookup(lookup_from(&[
            ("DATABASE_URL", "sqlite://timecard.db"),
            ("JWT_SECRET", "shhh"),
            ("PORT", "8080"),
            ("PUBLIC_BASE_URL", "https://time.example.com/"),
            ("GOOGLE_CLIENT_ID", "abc.apps.googleusercontent.com"),
            ("TIMECARD_UTC_OFFSET_MINUTES", "-300"),
        ]))?;

        assert_eq!(settings.port, 8080);
        assert_eq!(settings.public_base_url, "https://time.example.com");
        assert_eq!(
            settings.google_client_id.as_deref(),
            Some("abc.apps.googleusercontent.com")
        );
        assert_eq!(settings.utc_offset.local_minus_utc(), -300 * 60);

        Ok(())
    }

    #[test]
    fn test_missing_secret() {
        let res = Settings::from_lookup(lookup_from(&[("DATABASE_URL", "sqlite://timecard.db")]));
        assert!(res.is_err());
    }

    #[test]
    fn test_frontend_origin() -> Result<()> {
        let with_origin = |origin: &'static str| {
            Settings::from_lookup(lookup_from(&[
                ("DATABASE_URL", "sqlite://timecard.db"),
                ("JWT_SECRET", "shhh"),
                ("FRONTEND_ORIGIN", origin),
            ]))
        };

        assert_eq!(with_origin("http://localhost:5173/")?.frontend_origin, "http://localhost:5173");
        assert_eq!(with_origin(" https://time.example.com ")?.frontend_origin, "https://time.example.com");

        for bad in ["localhost:5173", "http://", "http://local host", "http://x.com/app", "http://x.com:99999"] {
            assert!(with_origin(bad).is_err(), "{}", bad);
        }

        Ok(())
    }

    #[test]
    fn test_bad_port() {
        let res = Settings::from_lookup(lookup_from(&[
            ("DATABASE_URL", "sqlite://timecard.db"),
            ("JWT_SECRET", "shhh"),
            ("PORT", "not-a-port"),
        ]));
        assert!(res.is_err());
    }
}
