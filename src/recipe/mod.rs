//! Typed container recipe
//!
//! A [`Recipe`] is an ordered list of stages, each an ordered list of
//! instructions. It renders to Dockerfile syntax and can check itself
//! against the packaging invariants a profile requires.

use anyhow::{Context, Result};
use std::fmt;

use crate::health::HealthProbe;
use crate::profile::{PortPolicy, PrivilegePolicy, Profile, StagePolicy};

#[cfg(test)]
mod tests;

/// Frontend directive written at the top of every rendered recipe
const SYNTAX_DIRECTIVE: &str = "# syntax=docker/dockerfile:1";

/// Continuation used for multi-line instructions
const CONTINUATION: &str = " \\\n    ";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandForm {
    /// JSON array, run without a shell
    Exec(Vec<String>),
    /// Run through `/bin/sh -c`, so variables expand at container start
    Shell(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    Comment(String),
    Arg {
        name: String,
        default: Option<String>,
    },
    Env(Vec<(String, String)>),
    Label(Vec<(String, String)>),
    Workdir(String),
    /// Commands chained with `&&` in one layer
    Run(Vec<String>),
    Copy {
        from: Option<String>,
        chown: Option<String>,
        sources: Vec<String>,
        dest: String,
    },
    User(String),
    Expose(u16),
    Healthcheck(HealthProbe),
    Cmd(CommandForm),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stage {
    pub base: String,
    pub alias: Option<String>,
    pub instructions: Vec<Instruction>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Recipe {
    pub stages: Vec<Stage>,
}

/// What a recipe is checked against
#[derive(Debug, Clone)]
pub struct RecipeRules<'a> {
    pub profile: Profile,
    pub workdir: &'a str,
    pub logs_dir: &'a str,
    pub build_packages: &'a [String],
    pub healthcheck: bool,
}

impl Stage {
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            alias: None,
            instructions: Vec::new(),
        }
    }

    pub fn named(base: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            alias: Some(alias.into()),
            ..Self::new(base)
        }
    }

    pub fn push(&mut self, instruction: Instruction) -> &mut Self {
        self.instructions.push(instruction);
        self
    }

    fn run_commands(&self) -> impl Iterator<Item = (usize, &String)> {
        self.instructions
            .iter()
            .enumerate()
            .filter_map(|(idx, inst)| match inst {
                Instruction::Run(cmds) => Some(cmds.iter().map(move |c| (idx, c))),
                _ => None,
            })
            .flatten()
    }
}

impl Recipe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn final_stage(&self) -> Option<&Stage> {
        self.stages.last()
    }

    pub fn render(&self) -> String {
        self.to_string()
    }

    /// sha256 of the rendered recipe
    pub fn digest(&self) -> String {
        format!("sha256:{}", sha256::digest(self.render()))
    }

    /// Check the recipe against the invariants the profile requires.
    /// Returns an error describing the first violation.
    pub fn validate(&self, rules: &RecipeRules<'_>) -> Result<()> {
        let final_stage = self.final_stage().context("Recipe has no stages")?;

        self.check_launch(final_stage, rules)?;
        self.check_healthcheck(final_stage, rules)?;
        if rules.profile.privilege_policy() == PrivilegePolicy::DropToUser {
            self.check_privilege_drop(final_stage, rules)?;
        }
        if rules.profile.stage_policy() == StagePolicy::BuilderRuntime {
            self.check_stage_separation(final_stage, rules)?;
        }
        Ok(())
    }

    fn check_launch(&self, stage: &Stage, rules: &RecipeRules<'_>) -> Result<()> {
        let cmds: Vec<&CommandForm> = stage
            .instructions
            .iter()
            .filter_map(|inst| match inst {
                Instruction::Cmd(form) => Some(form),
                _ => None,
            })
            .collect();

        if cmds.len() != 1 {
            anyhow::bail!(
                "Final stage must declare exactly one CMD, found {}",
                cmds.len()
            );
        }
        if !matches!(stage.instructions.last(), Some(Instruction::Cmd(_))) {
            anyhow::bail!("CMD must be the last instruction of the final stage");
        }

        if rules.profile.port_policy() == PortPolicy::FromEnv {
            match cmds[0] {
                CommandForm::Shell(cmd) if cmd.contains("${PORT:-") => {}
                _ => anyhow::bail!(
                    "Profile {} resolves its port at start time; CMD must be shell form reading ${{PORT:-...}}",
                    rules.profile
                ),
            }
        }
        Ok(())
    }

    fn check_healthcheck(&self, stage: &Stage, rules: &RecipeRules<'_>) -> Result<()> {
        let count = stage
            .instructions
            .iter()
            .filter(|inst| matches!(inst, Instruction::Healthcheck(_)))
            .count();
        let expected = usize::from(rules.healthcheck);
        if count != expected {
            anyhow::bail!(
                "Final stage must declare {} HEALTHCHECK instruction(s), found {}",
                expected,
                count
            );
        }
        Ok(())
    }

    fn check_privilege_drop(&self, stage: &Stage, rules: &RecipeRules<'_>) -> Result<()> {
        let users: Vec<(usize, &String)> = stage
            .instructions
            .iter()
            .enumerate()
            .filter_map(|(idx, inst)| match inst {
                Instruction::User(user) => Some((idx, user)),
                _ => None,
            })
            .collect();

        let (switch_idx, first_user) = *users
            .first()
            .context("Final stage never switches to an unprivileged user")?;
        if let Some((_, user)) = users.iter().find(|(_, user)| is_root_identity(user)) {
            anyhow::bail!("Final stage switches to privileged user {:?}", user);
        }

        let before_switch: Vec<&String> = stage
            .run_commands()
            .filter(|(idx, _)| *idx < switch_idx)
            .map(|(_, cmd)| cmd)
            .collect();

        if !before_switch
            .iter()
            .any(|cmd| cmd.starts_with("mkdir") && names_path(cmd, rules.logs_dir))
        {
            anyhow::bail!(
                "Log directory {} must be created before switching to {}",
                rules.logs_dir,
                first_user
            );
        }
        if !before_switch
            .iter()
            .any(|cmd| cmd.starts_with("chown -R") && names_path(cmd, rules.workdir))
        {
            anyhow::bail!(
                "Ownership of {} must be transferred recursively before switching to {}",
                rules.workdir,
                first_user
            );
        }
        Ok(())
    }

    fn check_stage_separation(&self, stage: &Stage, rules: &RecipeRules<'_>) -> Result<()> {
        if self.stages.len() < 2 {
            anyhow::bail!("Profile {} requires a builder stage", rules.profile);
        }
        let builder = self.stages[0]
            .alias
            .as_deref()
            .context("Builder stage must be named")?;

        let copies_from_builder = stage.instructions.iter().any(|inst| {
            matches!(inst, Instruction::Copy { from: Some(from), .. } if from == builder)
        });
        if !copies_from_builder {
            anyhow::bail!(
                "Final stage must copy resolved dependencies from stage {:?}",
                builder
            );
        }

        for (_, cmd) in stage.run_commands() {
            if let Some(package) = installed_packages(cmd)
                .into_iter()
                .find(|pkg| rules.build_packages.iter().any(|b| b == pkg))
            {
                anyhow::bail!(
                    "Final stage installs build-only package {:?}",
                    package
                );
            }
        }
        Ok(())
    }
}

impl fmt::Display for Recipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", SYNTAX_DIRECTIVE)?;
        for stage in &self.stages {
            writeln!(f)?;
            write!(f, "{}", stage)?;
        }
        Ok(())
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.alias {
            Some(alias) => writeln!(f, "FROM {} AS {}", self.base, alias)?,
            None => writeln!(f, "FROM {}", self.base)?,
        }
        for instruction in &self.instructions {
            if matches!(instruction, Instruction::Comment(_)) {
                writeln!(f)?;
            }
            writeln!(f, "{}", instruction)?;
        }
        Ok(())
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instruction::Comment(text) => write!(f, "# {}", text),
            Instruction::Arg { name, default } => match default {
                Some(default) => write!(f, "ARG {}={}", name, default),
                None => write!(f, "ARG {}", name),
            },
            Instruction::Env(vars) => write!(f, "ENV {}", key_values(vars, false)),
            Instruction::Label(labels) => write!(f, "LABEL {}", key_values(labels, true)),
            Instruction::Workdir(dir) => write!(f, "WORKDIR {}", dir),
            Instruction::Run(cmds) => {
                let separator = format!("{}&& ", CONTINUATION);
                write!(f, "RUN {}", cmds.join(separator.as_str()))
            }
            Instruction::Copy {
                from,
                chown,
                sources,
                dest,
            } => {
                write!(f, "COPY")?;
                if let Some(from) = from {
                    write!(f, " --from={}", from)?;
                }
                if let Some(chown) = chown {
                    write!(f, " --chown={}", chown)?;
                }
                write!(f, " {} {}", sources.join(" "), dest)
            }
            Instruction::User(user) => write!(f, "USER {}", user),
            Instruction::Expose(port) => write!(f, "EXPOSE {}", port),
            Instruction::Healthcheck(probe) => write!(
                f,
                "HEALTHCHECK {}{}CMD {}",
                probe.options(),
                CONTINUATION,
                probe.test_command()
            ),
            Instruction::Cmd(CommandForm::Exec(args)) => {
                let items: Vec<String> = args.iter().map(|a| json_string(a)).collect();
                write!(f, "CMD [{}]", items.join(", "))
            }
            Instruction::Cmd(CommandForm::Shell(cmd)) => write!(f, "CMD {}", cmd),
        }
    }
}

fn json_string(value: &str) -> String {
    serde_json::Value::String(value.to_string()).to_string()
}

fn key_values(pairs: &[(String, String)], always_quote: bool) -> String {
    pairs
        .iter()
        .map(|(key, value)| {
            let needs_quotes = always_quote
                || value.is_empty()
                || value.contains(|c: char| c.is_whitespace() || c == '"' || c == '\'');
            if needs_quotes {
                format!("{}={}", key, json_string(value))
            } else {
                format!("{}={}", key, value)
            }
        })
        .collect::<Vec<_>>()
        .join(CONTINUATION)
}

fn names_path(cmd: &str, path: &str) -> bool {
    let path = path.trim_end_matches('/');
    cmd.split_whitespace()
        .any(|word| word.trim_end_matches('/') == path)
}

/// `root`, `0`, `root:root`, `0:0` and friends
pub fn is_root_identity(user: &str) -> bool {
    let name = user.split(':').next().unwrap_or(user).trim();
    name == "root" || name == "0"
}

/// Packages named by an `apt-get install` or `apk add` command
fn installed_packages(cmd: &str) -> Vec<&str> {
    let words: Vec<&str> = cmd.split_whitespace().collect();
    let start = words
        .windows(2)
        .position(|w| (w[0] == "apt-get" && w[1] == "install") || (w[0] == "apk" && w[1] == "add"));
    match start {
        Some(pos) => words[pos + 2..]
            .iter()
            .copied()
            .filter(|w| !w.starts_with('-'))
            .collect(),
        None => Vec::new(),
    }
}
