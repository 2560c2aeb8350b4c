//! Server configuration loaded from environment variables.
//!
//! Values may also come from a `.env` file, loaded by the binary before
//! [`ServerConfig::from_env`] runs.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, bail};

const DEFAULT_SECRET_KEY: &str = "chatroom";
const DEFAULT_DATABASE_URL: &str = "sqlite://chatroom.db";
const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 5000;

/// Named configuration profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Profile {
    #[default]
    Development,
    Production,
    Testing,
}

impl FromStr for Profile {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" | "default" => Ok(Self::Development),
            "production" => Ok(Self::Production),
            "testing" => Ok(Self::Testing),
            other => bail!("unknown config profile '{other}'"),
        }
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Testing => "testing",
        })
    }
}

/// Where the SQLite database lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseLocation {
    File(PathBuf),
    Memory,
}

impl DatabaseLocation {
    /// Accepts `sqlite://<path>`, `sqlite:///<abs path>`, a bare path, and the
    /// in-memory forms `sqlite://`, `sqlite:///` and `:memory:`.
    pub fn parse(url: &str) -> anyhow::Result<Self> {
        let url = url.trim();
        let path = match url.strip_prefix("sqlite://") {
            Some(rest) => rest.to_string(),
            None if url.contains("://") => bail!("unsupported database URL '{url}'"),
            None => url.to_string(),
        };

        if matches!(path.as_str(), "" | "/" | ":memory:") {
            Ok(Self::Memory)
        } else {
            Ok(Self::File(PathBuf::from(path)))
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub profile: Profile,
    /// Signs session tokens.
    pub secret_key: String,
    pub database: DatabaseLocation,
    pub listen_addr: SocketAddr,
    /// Frames each gateway connection may have queued before it is evicted.
    pub delivery_capacity: usize,
}

impl ServerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unset keys take their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let profile = match lookup("CHATROOM_CONFIG").or_else(|| lookup("FLASK_CONFIG")) {
            Some(name) => name.parse()?,
            None => Profile::default(),
        };

        let secret_key = lookup("SECRET_KEY").unwrap_or_else(|| DEFAULT_SECRET_KEY.into());

        let database = if profile == Profile::Testing {
            DatabaseLocation::Memory
        } else {
            let url = lookup("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.into());
            DatabaseLocation::parse(&url)?
        };

        let host = lookup("CHATROOM_HOST").unwrap_or_else(|| DEFAULT_HOST.into());
        let port: u16 = match lookup("CHATROOM_PORT") {
            Some(raw) => raw.parse().with_context(|| format!("invalid CHATROOM_PORT '{raw}'"))?,
            None => DEFAULT_PORT,
        };
        let listen_addr: SocketAddr = format!("{}:{}", host, port)
            .parse()
            .with_context(|| format!("invalid listen address {host}:{port}"))?;

        let delivery_capacity = match lookup("CHATROOM_DELIVERY_CAPACITY") {
            Some(raw) => raw
                .parse()
                .with_context(|| format!("invalid CHATROOM_DELIVERY_CAPACITY '{raw}'"))?,
            None => chatroom_gateway::channel::DEFAULT_CAPACITY,
        };
        if delivery_capacity == 0 {
            bail!("CHATROOM_DELIVERY_CAPACITY must be at least 1");
        }

        Ok(Self {
            profile,
            secret_key,
            database,
            listen_addr,
            delivery_capacity,
        })
    }

    /// True when tokens are signed with the built-in key.
    pub fn uses_default_secret(&self) -> bool {
        self.secret_key == DEFAULT_SECRET_KEY
    }
}
