//! The parameterized build pipeline
//!
//! One pipeline produces every image variant. It runs the same steps in the
//! same order for each profile and lets the profile's policies decide how
//! each step is carried out:
//!
//! 1. dependency resolution
//! 2. runtime assembly
//! 3. privilege and filesystem preparation
//! 4. health supervision declaration
//! 5. process launch
//!
//! The assembled recipe is validated against the profile before it is
//! handed out, so a recipe that breaks an invariant is never rendered.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::config::Config;
use crate::constants::{env, image, label};
use crate::health::HealthProbe;
use crate::launch::LaunchSpec;
use crate::manifest::DependencyManifest;
use crate::profile::{PortPolicy, PrivilegePolicy, Profile, StagePolicy};
use crate::recipe::{Instruction, Recipe, RecipeRules, Stage};
use crate::runtime_env::RuntimeEnv;


pub struct Pipeline<'a> {
    profile: Profile,
    config: &'a Config,
    runtime: RuntimeEnv,
    logs_dir: String,
    title: Option<String>,
    created: Option<DateTime<Utc>>,
}

/// Summary of the dependency manifest a plan was made against
#[derive(Debug, Clone, Serialize)]
pub struct DependencySummary {
    pub path: String,
    pub requirements: usize,
    pub digest: String,
}

/// Machine-readable description of what a profile builds
#[derive(Debug, Clone, Serialize)]
pub struct BuildPlan {
    pub profile: Profile,
    pub stage_policy: StagePolicy,
    pub privilege_policy: PrivilegePolicy,
    pub port_policy: PortPolicy,
    pub base_image: String,
    pub stages: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    pub launch: LaunchSpec,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthProbe>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dependencies: Option<DependencySummary>,
    pub recipe_digest: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generated_at: Option<String>,
}

impl<'a> Pipeline<'a> {
    pub fn new(profile: Profile, config: &'a Config) -> Self {
        Self {
            profile,
            config,
            runtime: RuntimeEnv::default().with_environment(&config.environment),
            logs_dir: config.logs_dir(),
            title: None,
            created: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// Stamp the image with a creation time. Without it the rendered
    /// recipe is byte-for-byte reproducible.
    pub fn with_created(mut self, created: DateTime<Utc>) -> Self {
        self.created = Some(created);
        self
    }

    pub fn profile(&self) -> Profile {
        self.profile
    }

    fn healthcheck_enabled(&self) -> bool {
        self.config
            .health
            .enabled
            .unwrap_or(self.profile.declares_healthcheck())
    }

    fn drops_privileges(&self) -> bool {
        self.profile.privilege_policy() == PrivilegePolicy::DropToUser
    }

    fn user_spec(&self) -> String {
        format!("{}:{}", self.config.user.name, self.config.user.name)
    }

    pub fn rules(&self) -> RecipeRules<'_> {
        RecipeRules {
            profile: self.profile,
            workdir: &self.config.workdir,
            logs_dir: &self.logs_dir,
            build_packages: &self.config.packages.build,
            healthcheck: self.healthcheck_enabled(),
        }
    }

    pub fn launch_spec(&self) -> Result<LaunchSpec> {
        LaunchSpec::for_profile(self.profile, self.config)
    }

    pub fn health_probe(&self, launch: &LaunchSpec) -> Result<Option<HealthProbe>> {
        if !self.healthcheck_enabled() {
            return Ok(None);
        }
        HealthProbe::from_config(&self.config.health, launch.port.clone()).map(Some)
    }

    /// Assemble and validate the recipe for this profile
    pub fn recipe(&self) -> Result<Recipe> {
        let launch = self.launch_spec()?;
        let health = self.health_probe(&launch)?;

        let mut recipe = Recipe::new();
        let mut runtime = match self.profile.stage_policy() {
            StagePolicy::SingleStage => {
                let mut stage = Stage::new(&self.config.python_image);
                self.prelude(&mut stage);
                self.resolve_dependencies(&mut stage, false);
                stage
            }
            StagePolicy::BuilderRuntime => {
                let mut builder = Stage::named(&self.config.python_image, image::BUILDER_STAGE);
                builder.push(Instruction::Env(self.env_pairs(false)));
                builder.push(Instruction::Workdir(image::BUILD_DIR.to_string()));
                self.resolve_dependencies(&mut builder, true);
                recipe.stages.push(builder);

                let mut stage = Stage::new(&self.config.python_image);
                self.prelude(&mut stage);
                stage
            }
        };

        self.assemble_runtime(&mut runtime);
        if self.drops_privileges() {
            self.prepare_privileges(&mut runtime);
        }
        if let Some(probe) = health {
            runtime.push(Instruction::Comment("Health supervision".to_string()));
            runtime.push(Instruction::Healthcheck(probe));
        }
        runtime.push(Instruction::Comment("Process launch".to_string()));
        runtime.push(Instruction::Expose(launch.port.declared()));
        runtime.push(Instruction::Cmd(launch.command_form()));
        recipe.stages.push(runtime);

        recipe.validate(&self.rules())?;
        debug!(
            "Assembled {} recipe with {} stage(s)",
            self.profile,
            recipe.stages.len()
        );
        Ok(recipe)
    }

    pub fn plan(&self, manifest: Option<&DependencyManifest>) -> Result<BuildPlan> {
        let recipe = self.recipe()?;
        let launch = self.launch_spec()?;
        let health = self.health_probe(&launch)?;

        Ok(BuildPlan {
            profile: self.profile,
            stage_policy: self.profile.stage_policy(),
            privilege_policy: self.profile.privilege_policy(),
            port_policy: self.profile.port_policy(),
            base_image: self.config.python_image.clone(),
            stages: recipe
                .stages
                .iter()
                .map(|s| s.alias.clone().unwrap_or_else(|| "runtime".to_string()))
                .collect(),
            user: self
                .drops_privileges()
                .then(|| self.config.user.name.clone()),
            launch,
            health,
            dependencies: manifest.map(|m| DependencySummary {
                path: m.path.display().to_string(),
                requirements: m.len(),
                digest: m.digest(),
            }),
            recipe_digest: recipe.digest(),
            generated_at: self.created.map(|t| t.to_rfc3339()),
        })
    }

    fn env_pairs(&self, with_environment: bool) -> Vec<(String, String)> {
        let mut vars = self.runtime.image_env();
        if with_environment {
            vars.push((env::ENVIRONMENT.to_string(), format!("${{{}}}", env::ENVIRONMENT)));
        }
        vars
    }

    /// Build argument, environment, labels and workdir of the final stage
    fn prelude(&self, stage: &mut Stage) {
        stage.push(Instruction::Arg {
            name: env::ENVIRONMENT.to_string(),
            default: Some(self.runtime.environment.clone()),
        });
        stage.push(Instruction::Env(self.env_pairs(true)));

        let mut labels = Vec::new();
        if let Some(title) = &self.title {
            labels.push((label::TITLE.to_string(), title.clone()));
        }
        if let Some(created) = &self.created {
            labels.push((label::CREATED.to_string(), created.to_rfc3339()));
        }
        labels.push((label::PROFILE.to_string(), self.profile.to_string()));
        stage.push(Instruction::Label(labels));

        stage.push(Instruction::Workdir(self.config.workdir.clone()));
    }

    fn apt_install(packages: &[String]) -> Vec<String> {
        vec![
            "apt-get update".to_string(),
            format!(
                "apt-get install -y --no-install-recommends {}",
                packages.join(" ")
            ),
            "rm -rf /var/lib/apt/lists/*".to_string(),
        ]
    }

    /// Install OS and Python dependencies. With `user_install` the packages
    /// land in the per-user location so they can be copied out verbatim.
    fn resolve_dependencies(&self, stage: &mut Stage, user_install: bool) {
        stage.push(Instruction::Comment("Dependency resolution".to_string()));

        let mut packages = self.config.packages.build.clone();
        if !user_install {
            // A single stage also has to carry the runtime libraries
            for pkg in &self.config.packages.runtime {
                if !packages.contains(pkg) {
                    packages.push(pkg.clone());
                }
            }
        }
        if !packages.is_empty() {
            stage.push(Instruction::Run(Self::apt_install(&packages)));
        }

        stage.push(Instruction::Copy {
            from: None,
            chown: None,
            sources: vec![self.config.requirements.clone()],
            dest: ".".to_string(),
        });
        let pip = if user_install {
            format!(
                "pip install --user --no-warn-script-location -r {}",
                self.config.requirements
            )
        } else {
            format!("pip install -r {}", self.config.requirements)
        };
        stage.push(Instruction::Run(vec![pip]));
    }

    fn assemble_runtime(&self, stage: &mut Stage) {
        stage.push(Instruction::Comment("Runtime assembly".to_string()));

        if self.profile.stage_policy() == StagePolicy::BuilderRuntime {
            if !self.config.packages.runtime.is_empty() {
                stage.push(Instruction::Run(Self::apt_install(
                    &self.config.packages.runtime,
                )));
            }

            let home = self.config.user_home();
            let local = home.join(".local");
            let uid = self.config.user.uid;
            stage.push(Instruction::Copy {
                from: Some(image::BUILDER_STAGE.to_string()),
                chown: Some(format!("{}:{}", uid, uid)),
                sources: vec![image::BUILDER_USER_BASE.to_string()],
                dest: local.display().to_string(),
            });
            stage.push(Instruction::Env(vec![(
                "PATH".to_string(),
                format!("{}:$PATH", local.join("bin").display()),
            )]));
        }

        stage.push(Instruction::Copy {
            from: None,
            chown: None,
            sources: vec![".".to_string()],
            dest: ".".to_string(),
        });
    }

    /// Create the execution identity, hand it the application directory and
    /// switch to it. Ownership must change before the switch or the process
    /// cannot write its own logs.
    fn prepare_privileges(&self, stage: &mut Stage) {
        let name = &self.config.user.name;
        let uid = self.config.user.uid;
        let home = self.config.user_home();

        stage.push(Instruction::Comment(
            "Privilege and filesystem preparation".to_string(),
        ));
        stage.push(Instruction::Run(vec![
            format!("groupadd -r -g {} {}", uid, name),
            format!(
                "useradd -r -u {} -g {} -d {} -s /sbin/nologin {}",
                uid,
                name,
                home.display(),
                name
            ),
            format!("mkdir -p {}", self.logs_dir),
            format!(
                "chown -R {} {} {}",
                self.user_spec(),
                self.config.workdir,
                home.display()
            ),
        ]));
        stage.push(Instruction::User(name.clone()));
    }
}

/// Recipes for every profile, in profile order
pub fn render_all(config: &Config, created: Option<DateTime<Utc>>) -> Result<Vec<(Profile, Recipe)>> {
    Profile::all()
        .into_iter()
        .map(|profile| {
            let mut pipeline = Pipeline::new(profile, config);
            if let Some(created) = created {
                pipeline = pipeline.with_created(created);
            }
            Ok((profile, pipeline.recipe()?))
        })
        .collect()
}
