use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::profile::Profile;

#[derive(Parser)]
#[command(name = "stagehand")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Print the Dockerfile for a deployment profile
    Render {
        /// Deployment profile
        #[arg(long, value_enum, required_unless_present = "all")]
        profile: Option<Profile>,

        /// Render every profile into the --output directory
        #[arg(long, conflicts_with = "profile", requires = "output")]
        all: bool,

        /// Path to a stagehand.toml
        #[arg(long)]
        config: Option<PathBuf>,

        /// Write the recipe to a file instead of stdout (a directory with --all)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Leave out the creation timestamp
        #[arg(long)]
        deterministic: bool,
    },

    /// Print the build plan for a profile as JSON
    Plan {
        /// Deployment profile
        #[arg(long, value_enum)]
        profile: Profile,

        /// Path to a stagehand.toml
        #[arg(long)]
        config: Option<PathBuf>,

        /// Build context holding the dependency manifest
        #[arg(long, value_name = "DIRECTORY")]
        context: Option<PathBuf>,
    },

    /// Build a container image from an application directory
    Build {
        /// Deployment profile
        #[arg(long, value_enum)]
        profile: Profile,

        /// Path to the application directory
        #[arg(long, value_name = "DIRECTORY")]
        context: Option<PathBuf>,

        /// Path to a stagehand.toml
        #[arg(long)]
        config: Option<PathBuf>,

        /// Image tag (e.g., dashboard-api:latest)
        #[arg(long, env = "STAGEHAND_TAG")]
        tag: Option<String>,

        /// Value of the ENVIRONMENT build argument
        #[arg(long)]
        environment: Option<String>,

        /// Write the recipe into the context and skip the image build
        #[arg(long)]
        no_build: bool,

        /// Leave out the creation timestamp
        #[arg(long)]
        deterministic: bool,
    },

    /// Check a built image against the properties of its profile
    Verify {
        /// Deployment profile the image was built with
        #[arg(long, value_enum)]
        profile: Profile,

        /// Image reference or ID
        #[arg(long)]
        image: String,

        /// Path to a stagehand.toml
        #[arg(long)]
        config: Option<PathBuf>,

        /// Host port to publish the service on
        #[arg(long)]
        host_port: Option<u16>,
    },

    /// Probe a liveness endpoint once
    Probe {
        /// Full URL to probe
        #[arg(long, conflicts_with_all = ["port", "path"])]
        url: Option<String>,

        /// Port on localhost
        #[arg(long, default_value_t = crate::constants::server::PORT)]
        port: u16,

        /// Liveness path
        #[arg(long, default_value = crate::constants::health::PATH)]
        path: String,

        /// Seconds to wait for a response
        #[arg(long, default_value_t = crate::constants::health::TIMEOUT_SECS)]
        timeout: u64,
    },

    /// Resolve the start-time environment and start the ASGI server
    Launch {
        /// Deployment profile
        #[arg(long, value_enum)]
        profile: Profile,

        /// Path to a stagehand.toml
        #[arg(long)]
        config: Option<PathBuf>,

        /// Print the resolved command instead of running it
        #[arg(long)]
        dry_run: bool,
    },

    /// Show version information
    Version,
}
