//! Build service for orchestrating the build process
//!
//! Validates the build context, renders the recipe for the requested
//! profile, and hands context plus recipe to the container engine.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::{
    builder::{ContainerEngine, ContextArchive, DockerCli, ImageBuildRequest, RECIPE_DIR},
    config::Config,
    constants::env,
    launch::check_entry_point,
    manifest::DependencyManifest,
    pipeline::Pipeline,
    profile::Profile,
    recipe::Recipe,
};

/// Configuration for a build operation
pub struct BuildRequest {
    pub context_dir: PathBuf,
    pub profile: Profile,
    pub config: Config,
    pub tag: String,
    /// Value for the `ENVIRONMENT` build argument. Defaults to the config.
    pub environment: Option<String>,
    /// Write the recipe into the context instead of building
    pub no_build: bool,
    /// Leave out the creation timestamp so the recipe is reproducible
    pub deterministic: bool,
}

/// Result of a build operation
pub struct BuildResult {
    pub recipe_digest: String,
    pub recipe_path: Option<PathBuf>,
    pub image_id: Option<String>,
}

/// Recipe and manifest for a validated context
pub struct PreparedBuild {
    pub recipe: Recipe,
    pub manifest: DependencyManifest,
}

/// Service for orchestrating the build process
pub struct BuildService;

impl BuildService {
    /// Check the context and assemble the recipe. Nothing is built; a
    /// context that would produce a broken image fails here.
    pub fn prepare(request: &BuildRequest) -> Result<PreparedBuild> {
        let context_dir = &request.context_dir;
        info!(
            "Preparing {} build for {}",
            request.profile,
            context_dir.display()
        );

        let manifest = DependencyManifest::load(context_dir.join(&request.config.requirements))?;
        if manifest.is_empty() {
            warn!("{} lists no requirements", manifest.path.display());
        }
        check_entry_point(context_dir, &request.config.app)?;

        let mut pipeline = Pipeline::new(request.profile, &request.config);
        if let Some(title) = context_title(context_dir) {
            pipeline = pipeline.with_title(title);
        }
        if !request.deterministic {
            pipeline = pipeline.with_created(chrono::Utc::now());
        }
        let recipe = pipeline.recipe()?;

        Ok(PreparedBuild { recipe, manifest })
    }

    /// Build the image for the given request with the local docker CLI
    pub fn build(request: BuildRequest) -> Result<BuildResult> {
        if request.no_build {
            return Self::write_recipe(&request);
        }
        let docker = DockerCli::locate()?;
        Self::build_with(&docker, request)
    }

    /// Write the recipe into the build context without building
    pub fn write_recipe(request: &BuildRequest) -> Result<BuildResult> {
        let prepared = Self::prepare(request)?;
        let rendered = prepared.recipe.render();
        let path = request
            .context_dir
            .join(RECIPE_DIR)
            .join(request.profile.recipe_file_name());
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        std::fs::write(&path, &rendered)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        info!("Wrote recipe to {}", path.display());
        info!("Skipping image build (--no-build specified)");
        Ok(BuildResult {
            recipe_digest: prepared.recipe.digest(),
            recipe_path: Some(path),
            image_id: None,
        })
    }

    /// Pack the context and build it with `engine`. An engine failure
    /// aborts the build; no image ID is reported.
    pub fn build_with<E: ContainerEngine>(engine: &E, request: BuildRequest) -> Result<BuildResult> {
        if request.no_build {
            return Self::write_recipe(&request);
        }
        let prepared = Self::prepare(&request)?;
        let rendered = prepared.recipe.render();
        let recipe_digest = prepared.recipe.digest();
        let recipe_path = format!("{}/{}", RECIPE_DIR, request.profile.recipe_file_name());

        let context = ContextArchive::new(&request.context_dir)?.pack(&recipe_path, &rendered)?;

        let environment = request
            .environment
            .clone()
            .unwrap_or_else(|| request.config.environment.clone());
        let build_request = ImageBuildRequest {
            recipe_path,
            tag: request.tag.clone(),
            build_args: vec![(env::ENVIRONMENT.to_string(), environment)],
        };

        let image_id = engine.build(&build_request, context)?;

        Ok(BuildResult {
            recipe_digest,
            recipe_path: None,
            image_id: Some(image_id),
        })
    }
}

fn context_title(context_dir: &Path) -> Option<String> {
    let absolute = context_dir.canonicalize().ok()?;
    absolute
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::EngineOutput;
    use std::cell::RefCell;
    use std::fs;
    use tempfile::tempdir;

    /// Engine whose builds succeed with a fixed ID or fail with `stderr`
    struct ScriptedEngine {
        failure: Option<&'static str>,
        builds: RefCell<Vec<ImageBuildRequest>>,
    }

    impl ScriptedEngine {
        fn new(failure: Option<&'static str>) -> Self {
            Self {
                failure,
                builds: RefCell::new(Vec::new()),
            }
        }
    }

    impl ContainerEngine for ScriptedEngine {
        fn run(&self, _args: &[String]) -> Result<EngineOutput> {
            anyhow::bail!("not expected")
        }

        fn build(&self, request: &ImageBuildRequest, context: Vec<u8>) -> Result<String> {
            assert!(!context.is_empty());
            self.builds.borrow_mut().push(request.clone());
            match self.failure {
                Some(stderr) => anyhow::bail!("Docker build failed: {}", stderr),
                None => Ok("sha256:feedface".to_string()),
            }
        }
    }

    fn request(dir: &Path, profile: Profile) -> BuildRequest {
        BuildRequest {
            context_dir: dir.to_path_buf(),
            profile,
            config: Config::default(),
            tag: "dashboard:test".to_string(),
            environment: None,
            no_build: true,
            deterministic: true,
        }
    }

    fn write_context(dir: &Path) {
        fs::write(dir.join("requirements.txt"), "fastapi==0.109.0\nuvicorn\n").unwrap();
        fs::write(
            dir.join("main.py"),
            "from fastapi import FastAPI\napp = FastAPI()\n",
        )
        .unwrap();
    }

    #[test]
    fn test_no_build_writes_recipe() {
        let dir = tempdir().unwrap();
        write_context(dir.path());

        let result = BuildService::build(request(dir.path(), Profile::Hardened)).unwrap();
        let path = result.recipe_path.unwrap();
        assert_eq!(path, dir.path().join(".stagehand").join("Dockerfile.hardened"));
        assert!(result.image_id.is_none());

        let written = fs::read_to_string(path).unwrap();
        assert!(written.contains("USER appuser"));
        assert_eq!(
            result.recipe_digest,
            format!("sha256:{}", sha256::digest(written.as_str()))
        );
    }

    #[test]
    fn test_missing_manifest_aborts() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("main.py"), "app = None\n").unwrap();

        let err = BuildService::prepare(&request(dir.path(), Profile::Minimal))
            .err()
            .unwrap();
        assert!(err.to_string().contains("dependency manifest"));
    }

    #[test]
    fn test_misconfigured_entry_point_aborts() {
        let dir = tempdir().unwrap();
        write_context(dir.path());
        let mut req = request(dir.path(), Profile::PlatformManaged);
        req.config.app = "server:app".to_string();

        let err = BuildService::prepare(&req).err().unwrap();
        assert!(err.to_string().contains("server"));
    }

    #[test]
    fn test_prepare_labels_context_name() {
        let dir = tempdir().unwrap();
        let context = dir.path().join("dashboard-api");
        fs::create_dir_all(&context).unwrap();
        write_context(&context);

        let prepared = BuildService::prepare(&request(&context, Profile::Minimal)).unwrap();
        assert_eq!(prepared.manifest.requirements.len(), 2);
        assert!(prepared
            .recipe
            .render()
            .contains("org.opencontainers.image.title=\"dashboard-api\""));
    }

    #[test]
    fn test_build_passes_environment_and_reports_image() {
        let dir = tempdir().unwrap();
        write_context(dir.path());
        let mut req = request(dir.path(), Profile::Hardened);
        req.no_build = false;
        req.environment = Some("staging".to_string());

        let engine = ScriptedEngine::new(None);
        let result = BuildService::build_with(&engine, req).unwrap();
        assert_eq!(result.image_id.as_deref(), Some("sha256:feedface"));
        assert!(result.recipe_path.is_none());

        let builds = engine.builds.borrow();
        assert_eq!(builds[0].recipe_path, ".stagehand/Dockerfile.hardened");
        assert_eq!(
            builds[0].build_args,
            vec![("ENVIRONMENT".to_string(), "staging".to_string())]
        );
    }

    #[test]
    fn test_dependency_failure_aborts_build() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("requirements.txt"), "fastapi==99.0\n").unwrap();
        fs::write(dir.path().join("main.py"), "app = object()\n").unwrap();
        let mut req = request(dir.path(), Profile::Hardened);
        req.no_build = false;

        let engine = ScriptedEngine::new(Some(
            "ERROR: No matching distribution found for fastapi==99.0",
        ));
        let err = BuildService::build_with(&engine, req).err().unwrap();
        assert!(err
            .to_string()
            .contains("No matching distribution found for fastapi==99.0"));
        assert_eq!(engine.builds.borrow().len(), 1);
        assert!(!dir.path().join(".stagehand").exists());
    }
}
