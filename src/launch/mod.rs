//! Process launch contract
//!
//! Describes the command that starts the ASGI server and how its port is
//! chosen. Profiles that let the platform assign the port render a shell
//! form command so `PORT` is read when the container starts, not when the
//! image is built.

use anyhow::{Context, Result};
use serde::Serialize;
use std::path::Path;
use std::process::Command;
use tracing::{debug, info};

use crate::config::Config;
use crate::constants::{env, server};
use crate::profile::{PortPolicy, Profile};
use crate::recipe::CommandForm;
use crate::runtime_env::RuntimeEnv;

#[cfg(test)]
mod tests;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum PortBinding {
    Fixed { port: u16 },
    FromEnv { var: String, default: u16 },
}

impl PortBinding {
    pub fn fixed(port: u16) -> Self {
        PortBinding::Fixed { port }
    }

    pub fn from_env(default: u16) -> Self {
        PortBinding::FromEnv {
            var: env::PORT.to_string(),
            default,
        }
    }

    pub fn for_policy(policy: PortPolicy, port: u16) -> Self {
        match policy {
            PortPolicy::Fixed => Self::fixed(port),
            PortPolicy::FromEnv => Self::from_env(port),
        }
    }

    /// Port declared with EXPOSE
    pub fn declared(&self) -> u16 {
        match self {
            PortBinding::Fixed { port } => *port,
            PortBinding::FromEnv { default, .. } => *default,
        }
    }

    /// Port as written in a shell command
    pub fn shell_expr(&self) -> String {
        match self {
            PortBinding::Fixed { port } => port.to_string(),
            PortBinding::FromEnv { var, default } => format!("${{{}:-{}}}", var, default),
        }
    }

    /// Port the process binds given the start-time environment
    pub fn resolve(&self, runtime: &RuntimeEnv) -> u16 {
        match self {
            PortBinding::Fixed { port } => *port,
            PortBinding::FromEnv { default, .. } => runtime.resolved_port(*default),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LaunchSpec {
    pub program: String,
    pub app: String,
    pub host: String,
    pub port: PortBinding,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workers: Option<u16>,
    pub proxy_headers: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forwarded_allow_ips: Option<String>,
}

impl LaunchSpec {
    pub fn for_profile(profile: Profile, config: &Config) -> Result<Self> {
        validate_app_target(&config.app)?;

        let proxy_headers = profile.trusts_proxy_headers();
        Ok(Self {
            program: server::PROGRAM.to_string(),
            app: config.app.clone(),
            host: config.server.host.clone(),
            port: PortBinding::for_policy(profile.port_policy(), config.server.port),
            workers: config.server.workers.or(profile.default_workers()),
            proxy_headers,
            forwarded_allow_ips: proxy_headers.then(|| config.server.forwarded_allow_ips.clone()),
        })
    }

    fn args_with_port(&self, port: String) -> Vec<String> {
        let mut args = vec![
            self.program.clone(),
            self.app.clone(),
            "--host".to_string(),
            self.host.clone(),
            "--port".to_string(),
            port,
        ];
        if let Some(workers) = self.workers {
            args.push("--workers".to_string());
            args.push(workers.to_string());
        }
        if self.proxy_headers {
            args.push("--proxy-headers".to_string());
            if let Some(ips) = &self.forwarded_allow_ips {
                args.push("--forwarded-allow-ips".to_string());
                args.push(ips.clone());
            }
        }
        args
    }

    /// Command as declared in the image
    pub fn command_form(&self) -> CommandForm {
        match &self.port {
            PortBinding::Fixed { port } => CommandForm::Exec(self.args_with_port(port.to_string())),
            PortBinding::FromEnv { .. } => {
                let words: Vec<String> = self
                    .args_with_port(self.port.shell_expr())
                    .into_iter()
                    .map(|arg| shell_word(&arg))
                    .collect();
                // exec so the server, not the shell, receives stop signals
                CommandForm::Shell(format!("exec {}", words.join(" ")))
            }
        }
    }

    /// Concrete argv for the given start-time environment
    pub fn resolve(&self, runtime: &RuntimeEnv) -> Vec<String> {
        self.args_with_port(self.port.resolve(runtime).to_string())
    }

    /// Start the server locally and wait for it. Returns its exit code.
    pub fn run(&self, runtime: &RuntimeEnv) -> Result<i32> {
        let argv = self.resolve(runtime);
        let program = which::which(&argv[0])
            .with_context(|| format!("{} not found in PATH", argv[0]))?;

        info!("Launching {}", argv.join(" "));
        let mut cmd = Command::new(program);
        cmd.args(&argv[1..]);
        for (key, value) in runtime.image_env() {
            cmd.env(key, value);
        }
        cmd.env(env::ENVIRONMENT, &runtime.environment);
        debug!("Running command: {:?}", cmd);

        let status = cmd
            .status()
            .with_context(|| format!("Failed to start {}", argv[0]))?;
        Ok(status.code().unwrap_or(1))
    }
}

/// Check the `module:attribute` shape of an application target
pub fn validate_app_target(app: &str) -> Result<(&str, &str)> {
    let (module, attribute) = app
        .split_once(':')
        .with_context(|| format!("Application target {:?} must look like module:attribute", app))?;

    let is_identifier = |s: &str| {
        !s.is_empty()
            && !s.starts_with(|c: char| c.is_ascii_digit())
            && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
    };

    if module.split('.').any(|part| !is_identifier(part)) || !is_identifier(attribute) {
        anyhow::bail!("Application target {:?} must look like module:attribute", app);
    }
    Ok((module, attribute))
}

/// Verify the application entry point exists in the build context and
/// defines the attribute the server will load. A mismatch would make the
/// container exit immediately on start.
pub fn check_entry_point(context_dir: &Path, app: &str) -> Result<()> {
    let (module, attribute) = validate_app_target(app)?;
    let relative = module.replace('.', "/");

    let candidates = [
        context_dir.join(format!("{}.py", relative)),
        context_dir.join(&relative).join("__init__.py"),
    ];
    let source_path = candidates
        .iter()
        .find(|p| p.is_file())
        .with_context(|| {
            format!(
                "Entry point module {} not found in {}",
                module,
                context_dir.display()
            )
        })?;

    let source = std::fs::read_to_string(source_path)
        .with_context(|| format!("Failed to read {}", source_path.display()))?;

    if !defines_attribute(&source, attribute) {
        anyhow::bail!(
            "Entry point {} does not define {:?} in {}",
            app,
            attribute,
            source_path.display()
        );
    }

    debug!("Entry point {} found in {}", app, source_path.display());
    Ok(())
}

fn defines_attribute(source: &str, attribute: &str) -> bool {
    source.lines().any(|line| {
        // Only module-level statements count
        if line.starts_with(char::is_whitespace) {
            return false;
        }
        let line = line.trim_end();
        if let Some(rest) = line.strip_prefix(attribute) {
            let rest = rest.trim_start();
            return (rest.starts_with('=') && !rest.starts_with("=="))
                || rest.starts_with(':');
        }
        let imported = line.starts_with("from ")
            && (line.ends_with(&format!(" as {}", attribute))
                || line.ends_with(&format!("import {}", attribute)));
        imported
            || line.starts_with(&format!("def {}(", attribute))
            || line.starts_with(&format!("async def {}(", attribute))
    })
}

fn shell_word(arg: &str) -> String {
    let safe = |c: char| c.is_ascii_alphanumeric() || "-_./:=,".contains(c);
    if arg.starts_with("${") || arg.chars().all(safe) {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}
