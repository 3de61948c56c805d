use super::*;
use std::fs;
use tempfile::tempdir;

#[test]
fn test_default_config() {
    let config = Config::default();
    assert_eq!(config.python_image, "python:3.11-slim");
    assert_eq!(config.app, "main:app");
    assert_eq!(config.requirements, "requirements.txt");
    assert_eq!(config.workdir, "/app");
    assert_eq!(config.environment, "production");
    assert_eq!(config.server.port, 8000);
    assert_eq!(config.server.host, "0.0.0.0");
    assert!(config.server.workers.is_none());
    assert_eq!(config.user.name, "appuser");
    assert_eq!(config.packages.build, vec!["gcc", "libpq-dev"]);
    assert_eq!(config.health.path, "/health");
    assert!(config.health.enabled.is_none());
    assert!(config.validate().is_ok());
}

#[test]
fn test_partial_toml_keeps_defaults() {
    let config = Config::from_toml_str(
        r#"
app = "api.main:application"

[server]
workers = 2

[health]
path = "/livez"
retries = 5
"#,
    )
    .unwrap();

    assert_eq!(config.app, "api.main:application");
    assert_eq!(config.server.workers, Some(2));
    assert_eq!(config.server.port, 8000);
    assert_eq!(config.health.path, "/livez");
    assert_eq!(config.health.retries, 5);
    assert_eq!(config.health.interval_secs, 30);
}

#[test]
fn test_unknown_keys_are_rejected() {
    let result = Config::from_toml_str("pyhton_image = \"python:3.12\"");
    assert!(result.is_err());
}

#[test]
fn test_root_user_is_rejected() {
    let err = Config::from_toml_str("[user]\nname = \"root\"").unwrap_err();
    assert!(err.to_string().contains("unprivileged"));

    let err = Config::from_toml_str("[user]\nuid = 0").unwrap_err();
    assert!(err.to_string().contains("uid"));
}

#[test]
fn test_zero_workers_rejected() {
    assert!(Config::from_toml_str("[server]\nworkers = 0").is_err());
}

#[test]
fn test_load_prefers_project_file() {
    let dir = tempdir().unwrap();
    fs::write(
        dir.path().join(PROJECT_CONFIG),
        "python_image = \"python:3.12-slim\"\n",
    )
    .unwrap();

    let config = Config::load(None, dir.path()).unwrap();
    assert_eq!(config.python_image, "python:3.12-slim");
}

#[test]
fn test_load_explicit_missing_file() {
    let dir = tempdir().unwrap();
    let missing = dir.path().join("nope.toml");
    let err = Config::load(Some(&missing), dir.path()).unwrap_err();
    assert!(err.to_string().contains("Failed to read config file"));
}

#[test]
fn test_paths_derived_from_config() {
    let mut config = Config::default();
    config.workdir = "/srv/app/".to_string();
    assert_eq!(config.logs_dir(), "/srv/app/logs");
    assert_eq!(config.user_home(), PathBuf::from("/home/appuser"));
}
