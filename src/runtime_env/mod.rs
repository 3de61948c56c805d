//! Environment configuration resolved once per process
//!
//! The image variants read a handful of environment variables. Instead of
//! consulting them ad hoc, they are parsed into a [`RuntimeEnv`] with
//! documented defaults and validated up front.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::constants::env;


#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeEnv {
    /// `PYTHONUNBUFFERED`, default on
    pub python_unbuffered: bool,
    /// `PYTHONDONTWRITEBYTECODE`, default on
    pub dont_write_bytecode: bool,
    /// `PIP_NO_CACHE_DIR`, default on
    pub pip_no_cache_dir: bool,
    /// `ENVIRONMENT`, default `production`. Informational for the application.
    pub environment: String,
    /// `PORT`, only honored by profiles that resolve the port at start time
    pub port: Option<u16>,
}

impl Default for RuntimeEnv {
    fn default() -> Self {
        Self {
            python_unbuffered: true,
            dont_write_bytecode: true,
            pip_no_cache_dir: true,
            environment: env::DEFAULT_ENVIRONMENT.to_string(),
            port: None,
        }
    }
}

impl RuntimeEnv {
    /// Resolve from key/value pairs. Unrecognized keys are ignored.
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut resolved = Self::default();

        for (key, value) in vars {
            let key = key.as_ref();
            let value = value.as_ref();
            match key {
                env::PYTHONUNBUFFERED => resolved.python_unbuffered = parse_flag(key, value)?,
                env::PYTHONDONTWRITEBYTECODE => {
                    resolved.dont_write_bytecode = parse_flag(key, value)?
                }
                env::PIP_NO_CACHE_DIR => resolved.pip_no_cache_dir = parse_flag(key, value)?,
                env::ENVIRONMENT => {
                    let value = value.trim();
                    if !value.is_empty() {
                        resolved.environment = value.to_string();
                    }
                }
                env::PORT => resolved.port = parse_port(value)?,
                _ => {}
            }
        }

        Ok(resolved)
    }

    pub fn from_process_env() -> Result<Self> {
        Self::from_vars(std::env::vars())
    }

    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = environment.into();
        self
    }

    pub fn resolved_port(&self, default: u16) -> u16 {
        self.port.unwrap_or(default)
    }

    /// Variables baked into an image. `PORT` is never baked in.
    pub fn image_env(&self) -> Vec<(String, String)> {
        vec![
            (
                env::PYTHONUNBUFFERED.to_string(),
                flag_value(self.python_unbuffered),
            ),
            (
                env::PYTHONDONTWRITEBYTECODE.to_string(),
                flag_value(self.dont_write_bytecode),
            ),
            (
                env::PIP_NO_CACHE_DIR.to_string(),
                flag_value(self.pip_no_cache_dir),
            ),
        ]
    }
}

fn flag_value(on: bool) -> String {
    if on { "1" } else { "0" }.to_string()
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => anyhow::bail!(
            "Invalid value for {}: {:?} (expected 1/0, true/false, yes/no or on/off)",
            key,
            other
        ),
    }
}

fn parse_port(value: &str) -> Result<Option<u16>> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(None);
    }

    let port: u16 = value
        .parse()
        .with_context(|| format!("Invalid value for {}: {:?}", env::PORT, value))?;
    if port == 0 {
        anyhow::bail!("Invalid value for {}: port must be between 1 and 65535", env::PORT);
    }
    Ok(Some(port))
}
