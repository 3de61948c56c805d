use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::constants::{env, health, image, packages, server, user};

#[cfg(test)]
mod tests;

/// Project configuration file name, looked up in the build context
pub const PROJECT_CONFIG: &str = "stagehand.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Base image for every stage
    #[serde(default = "default_python_image")]
    pub python_image: String,

    /// ASGI application target in `module:attribute` form
    #[serde(default = "default_app")]
    pub app: String,

    /// Dependency manifest, relative to the build context
    #[serde(default = "default_requirements")]
    pub requirements: String,

    /// Application root inside the image
    #[serde(default = "default_workdir")]
    pub workdir: String,

    /// Default for the `ENVIRONMENT` build argument
    #[serde(default = "default_environment")]
    pub environment: String,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub user: UserConfig,

    #[serde(default)]
    pub packages: PackagesConfig,

    #[serde(default)]
    pub health: HealthConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    /// Declared port, and the fallback when `PORT` is unset
    #[serde(default = "default_port")]
    pub port: u16,

    /// Worker count override. Unset means the profile default.
    pub workers: Option<u16>,

    #[serde(default = "default_forwarded_allow_ips")]
    pub forwarded_allow_ips: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UserConfig {
    #[serde(default = "default_user_name")]
    pub name: String,

    /// Used for both the uid and the gid
    #[serde(default = "default_uid")]
    pub uid: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PackagesConfig {
    /// OS packages only needed while resolving dependencies
    #[serde(default = "default_build_packages")]
    pub build: Vec<String>,

    /// OS packages the running service needs
    #[serde(default = "default_runtime_packages")]
    pub runtime: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HealthConfig {
    #[serde(default = "default_health_path")]
    pub path: String,

    #[serde(default = "default_interval")]
    pub interval_secs: u64,

    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_start_period")]
    pub start_period_secs: u64,

    #[serde(default = "default_retries")]
    pub retries: u32,

    /// Force the HEALTHCHECK on or off. Unset means the profile default.
    pub enabled: Option<bool>,
}

fn default_python_image() -> String {
    image::PYTHON_BASE.to_string()
}

fn default_app() -> String {
    server::APP.to_string()
}

fn default_requirements() -> String {
    image::REQUIREMENTS.to_string()
}

fn default_workdir() -> String {
    image::WORKDIR.to_string()
}

fn default_environment() -> String {
    env::DEFAULT_ENVIRONMENT.to_string()
}

fn default_host() -> String {
    server::HOST.to_string()
}

fn default_port() -> u16 {
    server::PORT
}

fn default_forwarded_allow_ips() -> String {
    server::FORWARDED_ALLOW_IPS.to_string()
}

fn default_user_name() -> String {
    user::NAME.to_string()
}

fn default_uid() -> u32 {
    user::UID
}

fn default_build_packages() -> Vec<String> {
    packages::BUILD.iter().map(|p| p.to_string()).collect()
}

fn default_runtime_packages() -> Vec<String> {
    packages::RUNTIME.iter().map(|p| p.to_string()).collect()
}

fn default_health_path() -> String {
    health::PATH.to_string()
}

fn default_interval() -> u64 {
    health::INTERVAL_SECS
}

fn default_timeout() -> u64 {
    health::TIMEOUT_SECS
}

fn default_start_period() -> u64 {
    health::START_PERIOD_SECS
}

fn default_retries() -> u32 {
    health::RETRIES
}

impl Default for Config {
    fn default() -> Self {
        Self {
            python_image: default_python_image(),
            app: default_app(),
            requirements: default_requirements(),
            workdir: default_workdir(),
            environment: default_environment(),
            server: ServerConfig::default(),
            user: UserConfig::default(),
            packages: PackagesConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            workers: None,
            forwarded_allow_ips: default_forwarded_allow_ips(),
        }
    }
}

impl Default for UserConfig {
    fn default() -> Self {
        Self {
            name: default_user_name(),
            uid: default_uid(),
        }
    }
}

impl Default for PackagesConfig {
    fn default() -> Self {
        Self {
            build: default_build_packages(),
            runtime: default_runtime_packages(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            path: default_health_path(),
            interval_secs: default_interval(),
            timeout_secs: default_timeout(),
            start_period_secs: default_start_period(),
            retries: default_retries(),
            enabled: None,
        }
    }
}

impl Config {
    /// Load configuration from, in order: an explicit file, `stagehand.toml`
    /// in the build context, the user config directory, or built-in defaults.
    pub fn load(explicit: Option<&Path>, context_dir: &Path) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }

        let project_path = context_dir.join(PROJECT_CONFIG);
        if project_path.exists() {
            return Self::from_file(&project_path);
        }

        if let Some(config_dir) = dirs::config_dir() {
            let config_path = config_dir.join("stagehand").join("config.toml");
            if config_path.exists() {
                return Self::from_file(&config_path);
            }
        }

        debug!("No configuration file found, using defaults");
        Ok(Config::default())
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        debug!("Loading configuration from {}", path.display());
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.python_image.trim().is_empty() {
            anyhow::bail!("python_image must not be empty");
        }
        if !self.workdir.starts_with('/') {
            anyhow::bail!("workdir must be an absolute path: {:?}", self.workdir);
        }
        if self.server.port == 0 {
            anyhow::bail!("server.port must be between 1 and 65535");
        }
        if self.server.workers == Some(0) {
            anyhow::bail!("server.workers must be at least 1");
        }
        if self.user.name.trim().is_empty() || self.user.name == "root" {
            anyhow::bail!("user.name must name an unprivileged user, got {:?}", self.user.name);
        }
        if self.user.uid == 0 {
            anyhow::bail!("user.uid must not be 0");
        }
        Ok(())
    }

    /// Absolute path of the runtime-writable log directory
    pub fn logs_dir(&self) -> String {
        format!("{}/{}", self.workdir.trim_end_matches('/'), image::LOGS_DIR)
    }

    /// Home directory of the execution identity
    pub fn user_home(&self) -> PathBuf {
        PathBuf::from("/home").join(&self.user.name)
    }
}
