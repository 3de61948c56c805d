//! Image verification service
//!
//! Runs a built image through the properties its profile promises: the
//! identity the process runs as, absence of build tooling, a writable log
//! directory, and a liveness endpoint answering on the resolved port
//! within the start period.

use anyhow::{Context, Result};
use serde::Serialize;
use std::time::Duration;
use tracing::{info, warn};

use crate::{
    builder::ContainerEngine,
    config::Config,
    constants::{env, packages},
    health::{format_duration, wait_until_healthy, HealthProbe, ProbeOutcome},
    launch::{LaunchSpec, PortBinding},
    profile::{PortPolicy, PrivilegePolicy, Profile, StagePolicy},
};


/// Port the platform-managed image is started with to prove `PORT` is honored
const PLATFORM_TEST_PORT: u16 = 5050;

/// Parameters of a verification run
pub struct VerifyRequest {
    pub image: String,
    pub profile: Profile,
    pub config: Config,
    /// Host port to publish the service on. Picked automatically if unset.
    pub host_port: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum CheckOutcome {
    Passed { detail: String },
    Failed { detail: String },
    Skipped { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub name: String,
    #[serde(flatten)]
    pub outcome: CheckOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifyReport {
    pub image: String,
    pub profile: Profile,
    pub checks: Vec<CheckResult>,
}

impl VerifyReport {
    pub fn passed(&self) -> bool {
        !self
            .checks
            .iter()
            .any(|c| matches!(c.outcome, CheckOutcome::Failed { .. }))
    }
}

/// Service for verifying built images
pub struct VerifyService;

impl VerifyService {
    pub async fn verify<E: ContainerEngine>(engine: &E, request: &VerifyRequest) -> Result<VerifyReport> {
        let profile = request.profile;
        info!("Verifying {} image {}", profile, request.image);

        let mut checks = Vec::new();
        let mut record = |name: &str, outcome: CheckOutcome| {
            match &outcome {
                CheckOutcome::Failed { detail } => warn!("{}: FAILED ({})", name, detail),
                _ => info!("{}: {:?}", name, outcome),
            }
            checks.push(CheckResult {
                name: name.to_string(),
                outcome,
            });
        };

        if profile.privilege_policy() == PrivilegePolicy::DropToUser {
            record("non-root-identity", check_identity(engine, &request.image)?);
            record(
                "logs-writable",
                check_logs_writable(engine, &request.image, &request.config.logs_dir())?,
            );
        } else {
            let reason = format!("{} images run as the image default identity", profile);
            record("non-root-identity", CheckOutcome::Skipped { reason: reason.clone() });
            record("logs-writable", CheckOutcome::Skipped { reason });
        }

        if profile.stage_policy() == StagePolicy::BuilderRuntime {
            record("no-build-tooling", check_build_tooling(engine, &request.image)?);
        } else {
            record(
                "no-build-tooling",
                CheckOutcome::Skipped {
                    reason: format!("{} images keep build tooling", profile),
                },
            );
        }

        let launch = LaunchSpec::for_profile(profile, &request.config)?;
        let default_port = launch.port.declared();
        match profile.port_policy() {
            PortPolicy::Fixed => {
                let outcome =
                    check_liveness(engine, request, &launch.port, None, default_port).await?;
                record("liveness", outcome);
            }
            PortPolicy::FromEnv => {
                let outcome = check_liveness(
                    engine,
                    request,
                    &launch.port,
                    Some(PLATFORM_TEST_PORT),
                    PLATFORM_TEST_PORT,
                )
                .await?;
                record(&format!("liveness-port-{}", PLATFORM_TEST_PORT), outcome);

                let outcome =
                    check_liveness(engine, request, &launch.port, None, default_port).await?;
                record("liveness-port-default", outcome);
            }
        }

        Ok(VerifyReport {
            image: request.image.clone(),
            profile,
            checks,
        })
    }
}

fn args(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn check_identity<E: ContainerEngine>(engine: &E, image: &str) -> Result<CheckOutcome> {
    let output = engine.run(&args(&["run", "--rm", "--entrypoint", "id", image, "-u"]))?;
    if !output.success {
        return Ok(CheckOutcome::Failed {
            detail: format!("could not determine uid: {}", output.stderr.trim()),
        });
    }
    Ok(evaluate_identity(&output.stdout))
}

pub fn evaluate_identity(stdout: &str) -> CheckOutcome {
    match stdout.trim().parse::<u32>() {
        Ok(0) => CheckOutcome::Failed {
            detail: "process runs as uid 0".to_string(),
        },
        Ok(uid) => CheckOutcome::Passed {
            detail: format!("process runs as uid {}", uid),
        },
        Err(_) => CheckOutcome::Failed {
            detail: format!("unexpected output from id: {:?}", stdout.trim()),
        },
    }
}

fn check_build_tooling<E: ContainerEngine>(engine: &E, image: &str) -> Result<CheckOutcome> {
    let script = format!("command -v {} || true", packages::COMPILERS.join(" "));
    let output = engine.run(&args(&["run", "--rm", "--entrypoint", "sh", image, "-c", &script]))?;
    if !output.success {
        return Ok(CheckOutcome::Failed {
            detail: format!("inspection failed: {}", output.stderr.trim()),
        });
    }
    Ok(evaluate_build_tooling(&output.stdout))
}

pub fn evaluate_build_tooling(stdout: &str) -> CheckOutcome {
    let found: Vec<&str> = stdout.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
    if found.is_empty() {
        CheckOutcome::Passed {
            detail: format!("none of {} present", packages::COMPILERS.join(", ")),
        }
    } else {
        CheckOutcome::Failed {
            detail: format!("build tooling present: {}", found.join(", ")),
        }
    }
}

fn check_logs_writable<E: ContainerEngine>(
    engine: &E,
    image: &str,
    logs_dir: &str,
) -> Result<CheckOutcome> {
    let script = format!(
        "touch {dir}/.stagehand-write-test && rm {dir}/.stagehand-write-test && echo writable",
        dir = logs_dir
    );
    let output = engine.run(&args(&["run", "--rm", "--entrypoint", "sh", image, "-c", &script]))?;
    Ok(evaluate_logs_writable(output.success, &output.stdout, logs_dir))
}

pub fn evaluate_logs_writable(success: bool, stdout: &str, logs_dir: &str) -> CheckOutcome {
    if success && stdout.trim() == "writable" {
        CheckOutcome::Passed {
            detail: format!("{} is writable", logs_dir),
        }
    } else {
        CheckOutcome::Failed {
            detail: format!("{} is not writable by the runtime identity", logs_dir),
        }
    }
}

/// Start the image, wait for the liveness endpoint, and tear it down.
/// `port_env` is passed as `PORT`; `container_port` is where the server
/// is expected to listen.
async fn check_liveness<E: ContainerEngine>(
    engine: &E,
    request: &VerifyRequest,
    binding: &PortBinding,
    port_env: Option<u16>,
    container_port: u16,
) -> Result<CheckOutcome> {
    let probe = HealthProbe::from_config(&request.config.health, binding.clone())?;
    let host_port = match request.host_port {
        Some(port) => port,
        None => free_port()?,
    };

    let mut run_args = args(&["run", "--detach", "--rm", "--publish"]);
    run_args.push(format!("127.0.0.1:{}:{}", host_port, container_port));
    if let Some(port) = port_env {
        run_args.push("--env".to_string());
        run_args.push(format!("{}={}", env::PORT, port));
    }
    run_args.push(request.image.clone());

    let started = engine.run(&run_args)?;
    if !started.success {
        return Ok(CheckOutcome::Failed {
            detail: format!("container failed to start: {}", started.stderr.trim()),
        });
    }
    let container_id = started.stdout.trim().to_string();

    let url = probe.url("127.0.0.1", host_port);
    let result = wait_until_healthy(&url, &probe).await;

    let removed = engine.run(&args(&["rm", "--force", &container_id]));
    if let Err(e) = &removed {
        warn!("Failed to remove container {}: {}", container_id, e);
    }

    let (outcome, elapsed) = result?;
    Ok(evaluate_liveness(&outcome, elapsed, &probe, container_port))
}

/// Healthy is not enough: the endpoint has to answer before the start
/// period runs out.
pub fn evaluate_liveness(
    outcome: &ProbeOutcome,
    elapsed: Duration,
    probe: &HealthProbe,
    container_port: u16,
) -> CheckOutcome {
    let within = format_duration(probe.start_period);
    if !outcome.is_healthy() {
        return CheckOutcome::Failed {
            detail: format!(
                "{} not healthy on container port {} within {}: {:?}",
                probe.path, container_port, within, outcome
            ),
        };
    }
    if elapsed > probe.start_period {
        return CheckOutcome::Failed {
            detail: format!(
                "{} answered on container port {} after {:.1}s, past the start period {}",
                probe.path,
                container_port,
                elapsed.as_secs_f64(),
                within
            ),
        };
    }
    CheckOutcome::Passed {
        detail: format!(
            "{} answered on container port {} after {:.1}s (start period {})",
            probe.path,
            container_port,
            elapsed.as_secs_f64(),
            within
        ),
    }
}

fn free_port() -> Result<u16> {
    let listener =
        std::net::TcpListener::bind("127.0.0.1:0").context("Failed to find a free port")?;
    Ok(listener.local_addr()?.port())
}
