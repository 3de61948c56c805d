use anyhow::{Context, Result};
use clap::Parser;
use stagehand::{
    builder::DockerCli,
    cli::{Cli, Commands},
    config::Config,
    health::probe_once,
    launch::LaunchSpec,
    manifest::DependencyManifest,
    pipeline::{render_all, Pipeline},
    profile::Profile,
    runtime_env::RuntimeEnv,
    service::{BuildRequest, BuildService, VerifyRequest, VerifyService},
};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging to stderr
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Render {
            profile,
            all,
            config,
            output,
            deterministic,
        } => {
            let config = Config::load(config.as_deref(), Path::new("."))?;
            let created = (!deterministic).then(chrono::Utc::now);

            if all {
                let dir = output.context("--all requires --output")?;
                std::fs::create_dir_all(&dir)
                    .with_context(|| format!("Failed to create {}", dir.display()))?;
                for (profile, recipe) in render_all(&config, created)? {
                    let path = dir.join(profile.recipe_file_name());
                    write_output(&path, &recipe.render())?;
                }
                return Ok(());
            }

            let profile = profile.context("--profile is required")?;
            let mut pipeline = Pipeline::new(profile, &config);
            if let Some(created) = created {
                pipeline = pipeline.with_created(created);
            }
            let rendered = pipeline.recipe()?.render();
            match output {
                Some(path) => write_output(&path, &rendered)?,
                None => print!("{}", rendered),
            }
        }
        Commands::Plan {
            profile,
            config,
            context,
        } => {
            let context_dir = context.unwrap_or_else(|| PathBuf::from("."));
            let config = Config::load(config.as_deref(), &context_dir)?;

            let manifest_path = context_dir.join(&config.requirements);
            let manifest = if manifest_path.is_file() {
                Some(DependencyManifest::load(&manifest_path)?)
            } else {
                warn!(
                    "No dependency manifest at {}, plan omits dependencies",
                    manifest_path.display()
                );
                None
            };

            let plan = Pipeline::new(profile, &config)
                .with_created(chrono::Utc::now())
                .plan(manifest.as_ref())?;
            println!("{}", serde_json::to_string_pretty(&plan)?);
        }
        Commands::Build {
            profile,
            context,
            config,
            tag,
            environment,
            no_build,
            deterministic,
        } => {
            let context_dir = context.unwrap_or_else(|| PathBuf::from("."));
            let config = Config::load(config.as_deref(), &context_dir)?;
            let tag = match tag {
                Some(tag) => tag,
                None => default_tag(&context_dir, profile)?,
            };

            let result = BuildService::build(BuildRequest {
                context_dir,
                profile,
                config,
                tag,
                environment,
                no_build,
                deterministic,
            })?;

            // Print only the image ID (or the recipe digest) to stdout
            match result.image_id {
                Some(image_id) => println!("{}", image_id),
                None => println!("{}", result.recipe_digest),
            }
        }
        Commands::Verify {
            profile,
            image,
            config,
            host_port,
        } => {
            let config = Config::load(config.as_deref(), Path::new("."))?;
            let docker = DockerCli::locate()?;
            let request = VerifyRequest {
                image,
                profile,
                config,
                host_port,
            };

            let report = VerifyService::verify(&docker, &request).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.passed() {
                std::process::exit(1);
            }
        }
        Commands::Probe {
            url,
            port,
            path,
            timeout,
        } => {
            let url = url.unwrap_or_else(|| format!("http://127.0.0.1:{}{}", port, path));
            let outcome = probe_once(&url, Duration::from_secs(timeout)).await?;
            println!("{}", serde_json::to_string(&outcome)?);
            if !outcome.is_healthy() {
                std::process::exit(1);
            }
        }
        Commands::Launch {
            profile,
            config,
            dry_run,
        } => {
            let config = Config::load(config.as_deref(), Path::new("."))?;
            let runtime = RuntimeEnv::from_process_env()?;
            let launch = LaunchSpec::for_profile(profile, &config)?;

            if dry_run {
                println!("{}", launch.resolve(&runtime).join(" "));
            } else {
                let code = launch.run(&runtime)?;
                std::process::exit(code);
            }
        }
        Commands::Version => {
            println!("stagehand {}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}

fn write_output(path: &Path, content: &str) -> Result<()> {
    std::fs::write(path, content)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    info!("Wrote {}", path.display());
    Ok(())
}

/// `<context directory name>:<profile>`, lowercased for the registry
fn default_tag(context_dir: &Path, profile: Profile) -> Result<String> {
    let absolute = context_dir
        .canonicalize()
        .with_context(|| format!("Failed to resolve {}", context_dir.display()))?;
    let name = absolute
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .context("Build context has no directory name, pass --tag")?;
    Ok(format!("{}:{}", name, profile))
}
