/// Network defaults for the ASGI server
pub mod server {
    /// Address the server binds inside the container
    pub const HOST: &str = "0.0.0.0";

    /// Port declared by every image and used when `PORT` is unset
    pub const PORT: u16 = 8000;

    /// Worker processes started by the hardened profile
    pub const HARDENED_WORKERS: u16 = 4;

    /// Proxy addresses trusted for forwarded headers
    pub const FORWARDED_ALLOW_IPS: &str = "*";

    /// ASGI server executable
    pub const PROGRAM: &str = "uvicorn";

    /// Application object loaded by the server
    pub const APP: &str = "main:app";
}

/// Environment variable names recognized at build and start time
pub mod env {
    pub const PYTHONUNBUFFERED: &str = "PYTHONUNBUFFERED";
    pub const PYTHONDONTWRITEBYTECODE: &str = "PYTHONDONTWRITEBYTECODE";
    pub const PIP_NO_CACHE_DIR: &str = "PIP_NO_CACHE_DIR";
    pub const ENVIRONMENT: &str = "ENVIRONMENT";
    pub const PORT: &str = "PORT";

    /// Default value of the `ENVIRONMENT` build argument
    pub const DEFAULT_ENVIRONMENT: &str = "production";
}

/// Image layout
pub mod image {
    /// Default Python base image for every stage
    pub const PYTHON_BASE: &str = "python:3.11-slim";

    /// Application root inside the image
    pub const WORKDIR: &str = "/app";

    /// Scratch directory used by the builder stage
    pub const BUILD_DIR: &str = "/build";

    /// Runtime-writable log directory, relative to the workdir
    pub const LOGS_DIR: &str = "logs";

    /// Dependency manifest expected at the build context root
    pub const REQUIREMENTS: &str = "requirements.txt";

    /// Name of the builder stage
    pub const BUILDER_STAGE: &str = "builder";

    /// Per-user install location of the root user in the builder stage
    pub const BUILDER_USER_BASE: &str = "/root/.local";
}

/// Execution identity created by the hardened profile
pub mod user {
    /// Unprivileged user and group name
    pub const NAME: &str = "appuser";

    /// UID and GID of the unprivileged identity
    pub const UID: u32 = 1000;
}

/// System packages
pub mod packages {
    /// Build-only tooling needed to compile native wheels
    pub const BUILD: &[&str] = &["gcc", "libpq-dev"];

    /// Client libraries needed at runtime
    pub const RUNTIME: &[&str] = &["libpq5", "curl"];

    /// Executables whose presence in a final image indicates leaked build tooling
    pub const COMPILERS: &[&str] = &["gcc", "cc"];
}

/// Liveness probe defaults
pub mod health {
    pub const PATH: &str = "/health";
    pub const INTERVAL_SECS: u64 = 30;
    pub const TIMEOUT_SECS: u64 = 10;
    pub const START_PERIOD_SECS: u64 = 40;
    pub const RETRIES: u32 = 3;
}

/// OCI label keys
pub mod label {
    pub const TITLE: &str = "org.opencontainers.image.title";
    pub const CREATED: &str = "org.opencontainers.image.created";
    pub const PROFILE: &str = "io.stagehand.profile";
}
