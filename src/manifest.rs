//! Dependency manifest (pip requirements file) read at build time.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// A single named package with an optional version constraint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirement {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extras: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub constraint: Option<String>,
}

/// Ordered list of requirements plus any pip option lines
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyManifest {
    pub path: PathBuf,
    pub requirements: Vec<Requirement>,
    /// VCS, URL and local path requirements, kept as written
    pub references: Vec<String>,
    pub options: Vec<String>,
    #[serde(skip)]
    content: String,
}

impl DependencyManifest {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read dependency manifest: {}", path.display()))?;
        Self::parse(path, content)
    }

    pub fn parse(path: impl AsRef<Path>, content: String) -> Result<Self> {
        let mut requirements = Vec::new();
        let mut references = Vec::new();
        let mut options = Vec::new();

        for (idx, raw) in content.lines().enumerate() {
            let line = strip_comment(raw).trim();
            if line.is_empty() {
                continue;
            }
            if line.starts_with('-') {
                options.push(line.to_string());
                continue;
            }
            if is_direct_reference(line) {
                references.push(line.to_string());
                continue;
            }
            let requirement = parse_requirement(line).with_context(|| {
                format!(
                    "Invalid requirement on line {} of {}",
                    idx + 1,
                    path.as_ref().display()
                )
            })?;
            requirements.push(requirement);
        }

        Ok(Self {
            path: path.as_ref().to_path_buf(),
            requirements,
            references,
            options,
            content,
        })
    }

    /// sha256 of the manifest content, recorded in build plans
    pub fn digest(&self) -> String {
        format!("sha256:{}", sha256::digest(self.content.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty() && self.references.is_empty()
    }

    /// Named requirements plus direct references
    pub fn len(&self) -> usize {
        self.requirements.len() + self.references.len()
    }
}

fn strip_comment(line: &str) -> &str {
    // pip only treats '#' as a comment at line start or after whitespace
    let mut prev_is_space = true;
    for (pos, c) in line.char_indices() {
        if c == '#' && prev_is_space {
            return &line[..pos];
        }
        prev_is_space = c.is_whitespace();
    }
    line
}

/// Lines pip installs from a location rather than by package name
fn is_direct_reference(line: &str) -> bool {
    const VCS: &[&str] = &["git+", "hg+", "svn+", "bzr+"];
    line.contains("://")
        || VCS.iter().any(|prefix| line.starts_with(prefix))
        || line.starts_with(&['.', '/', '~'][..])
}

fn parse_requirement(line: &str) -> Result<Requirement> {
    // Environment markers are kept with the constraint
    let name_end = line
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-'))
        .unwrap_or(line.len());
    let name = &line[..name_end];
    if name.is_empty() {
        anyhow::bail!("missing package name in {:?}", line);
    }

    let mut rest = line[name_end..].trim_start();
    let mut extras = None;
    if let Some(after) = rest.strip_prefix('[') {
        let close = after
            .find(']')
            .with_context(|| format!("unterminated extras in {:?}", line))?;
        extras = Some(after[..close].trim().to_string());
        rest = after[close + 1..].trim_start();
    }

    let constraint = if rest.is_empty() {
        None
    } else if rest.starts_with(&['=', '<', '>', '!', '~', ';', '@'][..]) {
        Some(rest.to_string())
    } else {
        anyhow::bail!("unexpected text after package name in {:?}", line);
    };

    Ok(Requirement {
        name: name.to_string(),
        extras,
        constraint,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_parse_preserves_order_and_constraints() {
        let content = r#"
# web
fastapi==0.109.0
uvicorn[standard]>=0.27.0  # server
structlog
-r extra.txt
psycopg2-binary ~= 2.9
"#;
        let manifest = DependencyManifest::parse("requirements.txt", content.to_string()).unwrap();
        let names: Vec<_> = manifest
            .requirements
            .iter()
            .map(|r| r.name.as_str())
            .collect();
        assert_eq!(names, vec!["fastapi", "uvicorn", "structlog", "psycopg2-binary"]);
        assert_eq!(
            manifest.requirements[0].constraint.as_deref(),
            Some("==0.109.0")
        );
        assert_eq!(manifest.requirements[1].extras.as_deref(), Some("standard"));
        assert_eq!(
            manifest.requirements[1].constraint.as_deref(),
            Some(">=0.27.0")
        );
        assert_eq!(manifest.requirements[2].constraint, None);
        assert_eq!(manifest.options, vec!["-r extra.txt"]);
    }

    #[test]
    fn test_direct_references_are_kept() {
        let content = "git+https://github.com/encode/uvicorn.git#egg=uvicorn\n\
                       ./vendor/mylib\n\
                       https://example.com/pkg-1.0.tar.gz  # pinned tarball\n\
                       fastapi\n";
        let manifest = DependencyManifest::parse("requirements.txt", content.to_string()).unwrap();
        assert_eq!(
            manifest.references,
            vec![
                "git+https://github.com/encode/uvicorn.git#egg=uvicorn",
                "./vendor/mylib",
                "https://example.com/pkg-1.0.tar.gz",
            ]
        );
        assert_eq!(manifest.requirements.len(), 1);
        assert_eq!(manifest.len(), 4);
        assert!(!manifest.is_empty());
    }

    #[test]
    fn test_tab_before_comment() {
        let manifest =
            DependencyManifest::parse("requirements.txt", "pkg==1.0\t# note\n".to_string()).unwrap();
        assert_eq!(manifest.requirements[0].constraint.as_deref(), Some("==1.0"));
    }

    #[test]
    fn test_invalid_line_reports_line_number() {
        let err = DependencyManifest::parse("requirements.txt", "fastapi\nnot a package\n".into())
            .unwrap_err();
        assert!(format!("{:#}", err).contains("line 2"));
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempdir().unwrap();
        let result = DependencyManifest::load(dir.path().join("requirements.txt"));
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Failed to read dependency manifest"));
    }

    #[test]
    fn test_digest_tracks_content() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("requirements.txt");
        fs::write(&path, "fastapi==0.109.0\n").unwrap();
        let first = DependencyManifest::load(&path).unwrap();

        fs::write(&path, "fastapi==0.110.0\n").unwrap();
        let second = DependencyManifest::load(&path).unwrap();

        assert!(first.digest().starts_with("sha256:"));
        assert_ne!(first.digest(), second.digest());
    }
}
