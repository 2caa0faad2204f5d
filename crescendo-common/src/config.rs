//! Configuration loading and database path resolution

use crate::{Error, Result};
use serde::Deserialize;
use std::path::PathBuf;

/// Deployment environment for webhook routing.
///
/// Apple sends sandbox receipts to whichever endpoint is registered, so a
/// production deployment has to recognize sandbox payloads and hand them to
/// the staging deployment instead of processing them locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Production,
    Staging,
}

impl std::str::FromStr for Environment {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "production" | "prod" => Ok(Environment::Production),
            "staging" | "stage" => Ok(Environment::Staging),
            other => Err(Error::Config(format!("Unknown environment: {}", other))),
        }
    }
}

/// Service configuration shared by the API server and the CLI tools
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub database: PathBuf,
    pub environment: Environment,
    /// Where sandbox Apple payloads are forwarded when running in production
    pub staging_forward_url: Option<String>,
    /// Number of days a royalty invitation stays confirmable after sending
    pub invite_expiration_days: i64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            port: 5760,
            database: get_default_database_path(),
            environment: Environment::Production,
            staging_forward_url: None,
            invite_expiration_days: 30,
        }
    }
}

/// Optional TOML config file contents
#[derive(Debug, Deserialize, Default)]
struct ConfigFile {
    port: Option<u16>,
    database: Option<PathBuf>,
    environment: Option<String>,
    staging_forward_url: Option<String>,
    invite_expiration_days: Option<i64>,
}

/// Database path resolution priority order:
/// 1. Command-line argument (highest priority)
/// 2. Environment variable
/// 3. TOML config file
/// 4. OS-dependent compiled default (fallback)
pub fn resolve_database_path(cli_arg: Option<&str>, env_var_name: &str) -> Result<PathBuf> {
    // Priority 1: Command-line argument
    if let Some(path) = cli_arg {
        return Ok(PathBuf::from(path));
    }

    // Priority 2: Environment variable
    if let Ok(path) = std::env::var(env_var_name) {
        return Ok(PathBuf::from(path));
    }

    // Priority 3: TOML config file
    if let Ok(config_path) = find_config_file() {
        if let Ok(toml_content) = std::fs::read_to_string(&config_path) {
            if let Ok(config) = toml::from_str::<ConfigFile>(&toml_content) {
                if let Some(database) = config.database {
                    return Ok(database);
                }
            }
        }
    }

    // Priority 4: OS-dependent compiled default
    Ok(get_default_database_path())
}

/// Load full configuration, layering the TOML file (when present) over
/// compiled defaults. CLI arguments are applied by the caller on top.
pub fn load_config() -> Result<Config> {
    let mut config = Config::default();

    if let Ok(config_path) = find_config_file() {
        let toml_content = std::fs::read_to_string(&config_path)?;
        let file: ConfigFile = toml::from_str(&toml_content)
            .map_err(|e| Error::Config(format!("Bad config file {:?}: {}", config_path, e)))?;

        if let Some(port) = file.port {
            config.port = port;
        }
        if let Some(database) = file.database {
            config.database = database;
        }
        if let Some(environment) = file.environment {
            config.environment = environment.parse()?;
        }
        if file.staging_forward_url.is_some() {
            config.staging_forward_url = file.staging_forward_url;
        }
        if let Some(days) = file.invite_expiration_days {
            config.invite_expiration_days = days;
        }
    }

    Ok(config)
}

/// Get default configuration file path for the platform
fn find_config_file() -> Result<PathBuf> {
    if cfg!(target_os = "linux") {
        // Try ~/.config/crescendo/config.toml first, then /etc/crescendo/config.toml
        let user_config = dirs::config_dir().map(|d| d.join("crescendo").join("config.toml"));
        let system_config = PathBuf::from("/etc/crescendo/config.toml");

        if let Some(path) = user_config {
            if path.exists() {
                return Ok(path);
            }
        }
        if system_config.exists() {
            return Ok(system_config);
        }
        return Err(Error::Config("No config file found".to_string()));
    }

    let path = dirs::config_dir()
        .map(|d| d.join("crescendo").join("config.toml"))
        .ok_or_else(|| Error::Config("Could not determine config directory".to_string()))?;

    if path.exists() {
        Ok(path)
    } else {
        Err(Error::Config(format!("Config file not found: {:?}", path)))
    }
}

/// Get OS-dependent default database path
fn get_default_database_path() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("crescendo").join("crescendo.db"))
        .unwrap_or_else(|| PathBuf::from("/var/lib/crescendo/crescendo.db"))
}
