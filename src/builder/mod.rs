use anyhow::{Context, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tar::Builder;
use tracing::{debug, error, info};


/// Directory inside the build context that holds generated recipes
pub const RECIPE_DIR: &str = ".stagehand";

/// Entries never sent to the image builder, at any depth
const ALWAYS_EXCLUDED: &[&str] = &[
    ".git",
    "__pycache__",
    "*.pyc",
    ".venv",
    ".env",
    ".dockerignore",
    RECIPE_DIR,
];

/// Ignore file shipped in the archive so `COPY . .` leaves out the
/// generated recipe. The daemon still reads the recipe itself.
const ARCHIVE_IGNORE: &str = ".dockerignore";

/// Output of a container engine invocation
#[derive(Debug, Clone)]
pub struct EngineOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Something that can run container engine subcommands
pub trait ContainerEngine {
    fn run(&self, args: &[String]) -> Result<EngineOutput>;

    /// Build an image from a gzipped context and return its ID
    fn build(&self, request: &ImageBuildRequest, context: Vec<u8>) -> Result<String>;
}

/// The local `docker` CLI
pub struct DockerCli {
    program: PathBuf,
}

impl DockerCli {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn locate() -> Result<Self> {
        let program = which::which("docker").context("docker not found in PATH")?;
        debug!("Using container engine at {}", program.display());
        Ok(Self::new(program))
    }
}

impl ContainerEngine for DockerCli {
    /// Run `docker build` reading a gzipped context from stdin
    fn build(&self, request: &ImageBuildRequest, context: Vec<u8>) -> Result<String> {
        let iid_dir = tempfile::tempdir().context("Failed to create temporary directory")?;
        let iid_file = iid_dir.path().join("iid");

        let mut cmd = Command::new(&self.program);
        cmd.args(request.docker_args(&iid_file))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        debug!("Running command: {:?}", cmd);

        info!("Running docker build for {}", request.tag);
        let mut child = cmd.spawn().context("Failed to execute docker build")?;
        let mut stdin = child.stdin.take().context("Failed to open docker stdin")?;
        let writer = std::thread::spawn(move || stdin.write_all(&context));

        let output = child
            .wait_with_output()
            .context("Failed to wait for docker build")?;
        // A build that fails early closes stdin; the exit status tells the real story
        let _ = writer.join();

        if !output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!("Docker build failed!");
            error!("stdout:\n{}", stdout);
            error!("stderr:\n{}", stderr);
            anyhow::bail!("Docker build failed: {}", last_lines(&stderr, 20));
        }

        let image_id = std::fs::read_to_string(&iid_file)
            .context("Docker build did not report an image ID")?
            .trim()
            .to_string();
        info!("Successfully built image {} ({})", request.tag, image_id);
        Ok(image_id)
    }

    fn run(&self, args: &[String]) -> Result<EngineOutput> {
        let mut cmd = Command::new(&self.program);
        cmd.args(args);
        debug!("Running command: {:?}", cmd);

        let output = cmd
            .output()
            .with_context(|| format!("Failed to execute docker {}", args.join(" ")))?;
        Ok(EngineOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Parameters of a single image build
#[derive(Debug, Clone)]
pub struct ImageBuildRequest {
    /// Path of the recipe inside the context archive
    pub recipe_path: String,
    pub tag: String,
    pub build_args: Vec<(String, String)>,
}

impl ImageBuildRequest {
    fn docker_args(&self, iid_file: &Path) -> Vec<String> {
        let mut args = vec![
            "build".to_string(),
            "--file".to_string(),
            self.recipe_path.clone(),
            "--tag".to_string(),
            self.tag.clone(),
            "--iidfile".to_string(),
            iid_file.display().to_string(),
        ];
        for (key, value) in &self.build_args {
            args.push("--build-arg".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push("-".to_string());
        args
    }
}

/// `.dockerignore` rules, matched against paths relative to the context
/// root. Later rules override earlier ones.
struct IgnoreRules {
    set: GlobSet,
    negated: Vec<bool>,
}

impl IgnoreRules {
    fn parse(content: &str) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        let mut negated = Vec::new();
        for line in content.lines().map(str::trim) {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (negate, pattern) = match line.strip_prefix('!') {
                Some(rest) => (true, rest.trim()),
                None => (false, line),
            };
            let pattern = pattern
                .trim_start_matches("./")
                .trim_start_matches('/')
                .trim_end_matches('/');
            if pattern.is_empty() {
                continue;
            }
            builder.add(glob(pattern)?);
            negated.push(negate);
        }
        let set = builder
            .build()
            .context("Failed to compile .dockerignore patterns")?;
        Ok(Self { set, negated })
    }

    fn empty() -> Self {
        Self {
            set: GlobSet::empty(),
            negated: Vec::new(),
        }
    }

    fn has_negations(&self) -> bool {
        self.negated.iter().any(|n| *n)
    }

    /// A path is excluded when the last rule matching it, or one of its
    /// parent directories, is not a negation
    fn excludes(&self, relative: &str) -> bool {
        ancestors(relative)
            .flat_map(|candidate| self.set.matches(candidate))
            .max()
            .map(|idx| !self.negated[idx])
            .unwrap_or(false)
    }
}

fn glob(pattern: &str) -> Result<globset::Glob> {
    GlobBuilder::new(pattern)
        .literal_separator(true)
        .build()
        .with_context(|| format!("Invalid .dockerignore pattern: {}", pattern))
}

/// `a/b/c`, `a/b`, `a`
fn ancestors(relative: &str) -> impl Iterator<Item = &str> {
    let mut next = Some(relative);
    std::iter::from_fn(move || {
        let current = next?;
        next = current.rfind('/').map(|pos| &current[..pos]);
        Some(current)
    })
}

/// Packs the application source tree and a generated recipe into a
/// gzipped tar suitable for `docker build -`
pub struct ContextArchive {
    root: PathBuf,
    always: GlobSet,
    rules: IgnoreRules,
}

impl ContextArchive {
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.is_dir() {
            anyhow::bail!("Build context is not a directory: {}", root.display());
        }

        let mut always = GlobSetBuilder::new();
        for name in ALWAYS_EXCLUDED {
            always.add(glob(&format!("**/{}", name))?);
        }
        let always = always
            .build()
            .context("Failed to compile built-in exclusions")?;

        let ignore_file = root.join(".dockerignore");
        let rules = if ignore_file.is_file() {
            let content = std::fs::read_to_string(&ignore_file)
                .with_context(|| format!("Failed to read {}", ignore_file.display()))?;
            IgnoreRules::parse(&content)?
        } else {
            IgnoreRules::empty()
        };

        Ok(Self {
            root,
            always,
            rules,
        })
    }

    /// Relative paths of all files that would be sent, sorted
    pub fn files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        self.collect(Path::new(""), &mut files)?;
        files.sort();
        Ok(files)
    }

    fn collect(&self, relative: &Path, files: &mut Vec<PathBuf>) -> Result<()> {
        let dir = self.root.join(relative);
        let entries = std::fs::read_dir(&dir)
            .with_context(|| format!("Failed to read directory: {}", dir.display()))?;

        for entry in entries {
            let entry = entry?;
            let rel = relative.join(entry.file_name());
            let rel_str = rel.to_string_lossy().replace('\\', "/");
            if self.always.is_match(&rel_str) {
                debug!("Excluding {} from build context", rel.display());
                continue;
            }

            let excluded = self.rules.excludes(&rel_str);
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                // A negation further down may bring back files of an excluded directory
                if excluded && !self.rules.has_negations() {
                    debug!("Excluding {} from build context", rel.display());
                    continue;
                }
                self.collect(&rel, files)?;
            } else if file_type.is_file() {
                if excluded {
                    debug!("Excluding {} from build context", rel.display());
                    continue;
                }
                files.push(rel);
            }
        }
        Ok(())
    }

    /// Build the archive with `recipe` stored at `recipe_path`
    pub fn pack(&self, recipe_path: &str, recipe: &str) -> Result<Vec<u8>> {
        let files = self.files()?;
        debug!(
            "Packing {} file(s) from {}",
            files.len(),
            self.root.display()
        );

        let ignore = format!("{}\n{}\n", RECIPE_DIR, ARCHIVE_IGNORE);
        let mut tar_data = Vec::new();
        {
            let mut tar = Builder::new(&mut tar_data);
            for rel in &files {
                tar.append_path_with_name(self.root.join(rel), rel)
                    .with_context(|| format!("Failed to add {} to context", rel.display()))?;
            }
            append_generated(&mut tar, recipe_path, recipe)?;
            append_generated(&mut tar, ARCHIVE_IGNORE, &ignore)?;
            tar.finish()?;
        }

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&tar_data)?;
        let compressed = encoder.finish()?;

        info!(
            "Build context is {} bytes ({} compressed)",
            tar_data.len(),
            compressed.len()
        );
        Ok(compressed)
    }
}

fn append_generated<W: Write>(tar: &mut Builder<W>, path: &str, content: &str) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(content.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(0);
    header.set_cksum();
    tar.append_data(&mut header, path, content.as_bytes())
        .with_context(|| format!("Failed to add {} to context", path))
}

fn last_lines(text: &str, count: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(count);
    lines[start..].join("\n")
}
