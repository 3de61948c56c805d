//! Deployment profiles
//!
//! A profile selects the policies the pipeline applies for stage separation,
//! privilege handling and port resolution. It is the only place the three
//! image variants differ.

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::constants::server;


#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Profile {
    /// Single-stage image running as the image default identity
    Minimal,
    /// Builder/runtime split, unprivileged user, health check, multiple workers
    Hardened,
    /// Single-stage image whose port is assigned by the hosting platform
    PlatformManaged,
}

/// How dependencies are resolved relative to the runtime image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StagePolicy {
    /// Install straight into the only stage
    SingleStage,
    /// Install into a per-user location in a builder stage and copy it into a runtime stage
    BuilderRuntime,
}

/// Which identity the final process runs as
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PrivilegePolicy {
    ImageDefault,
    DropToUser,
}

/// When the listening port is decided
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PortPolicy {
    /// Fixed at image build time
    Fixed,
    /// Read from `PORT` when the container starts
    FromEnv,
}

impl Profile {
    pub fn all() -> [Profile; 3] {
        [Profile::Minimal, Profile::Hardened, Profile::PlatformManaged]
    }

    pub fn name(&self) -> &'static str {
        match self {
            Profile::Minimal => "minimal",
            Profile::Hardened => "hardened",
            Profile::PlatformManaged => "platform-managed",
        }
    }

    pub fn stage_policy(&self) -> StagePolicy {
        match self {
            Profile::Hardened => StagePolicy::BuilderRuntime,
            Profile::Minimal | Profile::PlatformManaged => StagePolicy::SingleStage,
        }
    }

    pub fn privilege_policy(&self) -> PrivilegePolicy {
        match self {
            Profile::Hardened => PrivilegePolicy::DropToUser,
            Profile::Minimal | Profile::PlatformManaged => PrivilegePolicy::ImageDefault,
        }
    }

    pub fn port_policy(&self) -> PortPolicy {
        match self {
            Profile::PlatformManaged => PortPolicy::FromEnv,
            Profile::Minimal | Profile::Hardened => PortPolicy::Fixed,
        }
    }

    /// Whether the image carries a HEALTHCHECK unless the config says otherwise
    pub fn declares_healthcheck(&self) -> bool {
        matches!(self, Profile::Hardened)
    }

    pub fn default_workers(&self) -> Option<u16> {
        match self {
            Profile::Hardened => Some(server::HARDENED_WORKERS),
            Profile::Minimal | Profile::PlatformManaged => None,
        }
    }

    /// Traffic reaches the hardened image through a reverse proxy
    pub fn trusts_proxy_headers(&self) -> bool {
        matches!(self, Profile::Hardened)
    }

    pub fn recipe_file_name(&self) -> &'static str {
        match self {
            Profile::Minimal => "Dockerfile",
            Profile::Hardened => "Dockerfile.hardened",
            Profile::PlatformManaged => "Dockerfile.platform",
        }
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
