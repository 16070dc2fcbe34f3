//! Configuration file management for marathon.
//!
//! Provides a TOML-based config file at `~/.config/marathon/config.toml` and
//! a resolution chain: CLI flag > env var > config file > default.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use marathon_db::config::DbConfig;

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigFile {
    pub orchestrator: OrchestratorSection,
    pub database: DatabaseSection,
    pub auth: AuthSection,
    #[serde(default)]
    pub tls: TlsSection,
    /// The client's own session state; absent until `marathon login`/`register` succeeds.
    #[serde(default)]
    pub session: SessionSection,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OrchestratorSection {
    pub address: String,
    pub port: u16,
    /// Port the worker wire listener binds, separate from the HTTP gateway's `port`.
    #[serde(default = "default_worker_port")]
    pub worker_port: u16,
}

fn default_worker_port() -> u16 {
    8421
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SessionSection {
    /// Bearer token issued by the last successful `login`/`register`, used
    /// by every other client command that needs to authenticate.
    pub token: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DatabaseSection {
    pub url: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AuthSection {
    /// Hex-encoded HMAC-SHA256 key used to sign client bearer tokens (64 hex chars = 32 bytes).
    pub jwt_secret: String,
    /// Hex-encoded shared secret workers present at registration time.
    pub node_auth_key: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct TlsSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub ca_path: Option<String>,
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the marathon config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/marathon` or `~/.config/marathon`.
/// We intentionally ignore the platform-specific `dirs::config_dir()`
/// (which returns `~/Library/Application Support` on macOS).
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("marathon");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("marathon")
}

/// Return the path to the marathon config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse the config file. Returns an error if it does not exist.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents).context("failed to parse config file")?;
    Ok(config)
}

/// Serialize and write the config file, creating parent dirs as needed.
/// Sets file permissions to 0600 on Unix.
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    // Set permissions to 0600 (owner read/write only) on Unix.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

/// Persist a freshly issued bearer token into the config file's session
/// section, creating the file with defaults if `init` was never run.
pub fn save_session_token(token: &str) -> Result<()> {
    let mut config = load_config().unwrap_or_else(|_| ConfigFile {
        orchestrator: OrchestratorSection {
            address: "127.0.0.1".to_string(),
            port: 8420,
            worker_port: default_worker_port(),
        },
        database: DatabaseSection { url: DbConfig::DEFAULT_URL.to_string() },
        auth: AuthSection { jwt_secret: String::new(), node_auth_key: String::new() },
        tls: TlsSection::default(),
        session: SessionSection::default(),
    });
    config.session.token = Some(token.to_string());
    save_config(&config)
}

// -----------------------------------------------------------------------
// Secret generation
// -----------------------------------------------------------------------

/// Generate a random secret: 32 random bytes, hex-encoded (64 chars). Used
/// for both `jwt_secret` and `node_auth_key` at `init` time.
pub fn generate_secret() -> String {
    use rand::Rng;
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes);
    hex::encode(bytes)
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Fully resolved configuration, ready for use by both the orchestrator
/// binary and the CLI's HTTP client.
#[derive(Debug)]
pub struct MarathonConfig {
    pub orchestrator_address: String,
    pub orchestrator_port: u16,
    pub worker_port: u16,
    pub db_config: DbConfig,
    pub jwt_secret: Vec<u8>,
    pub node_auth_key: Vec<u8>,
    pub tls_enabled: bool,
    pub tls_ca_path: Option<String>,
}

impl MarathonConfig {
    /// Base URL of the HTTP gateway, resolved from `orchestrator_address`/`orchestrator_port`.
    pub fn gateway_url(&self) -> String {
        let scheme = if self.tls_enabled { "https" } else { "http" };
        format!("{scheme}://{}:{}", self.orchestrator_address, self.orchestrator_port)
    }

    /// Socket address the worker wire listener binds on `serve`.
    pub fn worker_bind(&self) -> String {
        format!("{}:{}", self.orchestrator_address, self.worker_port)
    }

    /// Socket address the HTTP gateway binds on `serve`.
    pub fn gateway_bind(&self) -> String {
        format!("{}:{}", self.orchestrator_address, self.orchestrator_port)
    }

    /// Resolve configuration using the chain: CLI flag > env var > config file > default.
    pub fn resolve(cli_address: Option<&str>, cli_port: Option<u16>, cli_db_url: Option<&str>) -> Result<Self> {
        let file_config = load_config().ok();

        let orchestrator_address = cli_address
            .map(str::to_string)
            .or_else(|| std::env::var("MARATHON_ORCHESTRATOR_ADDRESS").ok())
            .or_else(|| file_config.as_ref().map(|c| c.orchestrator.address.clone()))
            .unwrap_or_else(|| "127.0.0.1".to_string());

        let orchestrator_port = if let Some(port) = cli_port {
            port
        } else if let Ok(port) = std::env::var("MARATHON_ORCHESTRATOR_PORT") {
            port.parse().context("MARATHON_ORCHESTRATOR_PORT is not a valid port number")?
        } else if let Some(ref cfg) = file_config {
            cfg.orchestrator.port
        } else {
            8420
        };

        let worker_port = file_config.as_ref().map(|c| c.orchestrator.worker_port).unwrap_or(default_worker_port());

        let db_url = if let Some(url) = cli_db_url {
            url.to_string()
        } else if let Ok(url) = std::env::var("POSTGRES_URL") {
            url
        } else if let Some(ref cfg) = file_config {
            cfg.database.url.clone()
        } else {
            DbConfig::DEFAULT_URL.to_string()
        };
        let db_config = DbConfig::new(db_url);

        let jwt_secret = if let Ok(secret_hex) = std::env::var("JWT_SECRET") {
            hex::decode(&secret_hex).context("JWT_SECRET env var is not valid hex")?
        } else if let Some(ref cfg) = file_config {
            hex::decode(&cfg.auth.jwt_secret).context("invalid hex in config file jwt_secret")?
        } else {
            bail!("JWT_SECRET not found; set JWT_SECRET or run `marathon init` to create a config file");
        };

        let node_auth_key = if let Ok(key_hex) = std::env::var("NODE_AUTH_KEY") {
            hex::decode(&key_hex).context("NODE_AUTH_KEY env var is not valid hex")?
        } else if let Some(ref cfg) = file_config {
            hex::decode(&cfg.auth.node_auth_key).context("invalid hex in config file node_auth_key")?
        } else {
            bail!("NODE_AUTH_KEY not found; set NODE_AUTH_KEY or run `marathon init` to create a config file");
        };

        let tls_enabled = if let Ok(v) = std::env::var("TLS_ENABLED") {
            v == "1" || v.eq_ignore_ascii_case("true")
        } else {
            file_config.as_ref().map(|c| c.tls.enabled).unwrap_or(false)
        };

        let tls_ca_path = std::env::var("TLS_CA_PATH")
            .ok()
            .or_else(|| file_config.as_ref().and_then(|c| c.tls.ca_path.clone()));

        Ok(Self {
            orchestrator_address,
            orchestrator_port,
            worker_port,
            db_config,
            jwt_secret,
            node_auth_key,
            tls_enabled,
            tls_ca_path,
        })
    }
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------
