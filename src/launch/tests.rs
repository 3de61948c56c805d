use super::*;
use std::fs;
use tempfile::tempdir;

#[test]
fn test_hardened_command() {
    let spec = LaunchSpec::for_profile(Profile::Hardened, &Config::default()).unwrap();
    assert_eq!(
        spec.command_form(),
        CommandForm::Exec(
            [
                "uvicorn",
                "main:app",
                "--host",
                "0.0.0.0",
                "--port",
                "8000",
                "--workers",
                "4",
                "--proxy-headers",
                "--forwarded-allow-ips",
                "*",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect()
        )
    );
}

#[test]
fn test_minimal_command_has_no_workers_or_proxy_flags() {
    let spec = LaunchSpec::for_profile(Profile::Minimal, &Config::default()).unwrap();
    match spec.command_form() {
        CommandForm::Exec(args) => {
            assert_eq!(
                args,
                vec!["uvicorn", "main:app", "--host", "0.0.0.0", "--port", "8000"]
            );
        }
        other => panic!("expected exec form, got {:?}", other),
    }
}

#[test]
fn test_platform_command_reads_port_at_start() {
    let spec = LaunchSpec::for_profile(Profile::PlatformManaged, &Config::default()).unwrap();
    assert_eq!(
        spec.command_form(),
        CommandForm::Shell(
            "exec uvicorn main:app --host 0.0.0.0 --port ${PORT:-8000}".to_string()
        )
    );
}

#[test]
fn test_platform_port_resolution() {
    let spec = LaunchSpec::for_profile(Profile::PlatformManaged, &Config::default()).unwrap();

    let with_port = RuntimeEnv::from_vars([("PORT", "5050")]).unwrap();
    let argv = spec.resolve(&with_port);
    assert_eq!(argv[4], "--port");
    assert_eq!(argv[5], "5050");

    let without_port = RuntimeEnv::default();
    let argv = spec.resolve(&without_port);
    assert_eq!(argv[5], "8000");
}

#[test]
fn test_fixed_port_ignores_env() {
    let spec = LaunchSpec::for_profile(Profile::Hardened, &Config::default()).unwrap();
    let runtime = RuntimeEnv::from_vars([("PORT", "5050")]).unwrap();
    assert_eq!(spec.resolve(&runtime)[5], "8000");
}

#[test]
fn test_worker_override() {
    let mut config = Config::default();
    config.server.workers = Some(2);
    let spec = LaunchSpec::for_profile(Profile::Minimal, &config).unwrap();
    assert_eq!(spec.workers, Some(2));
}

#[test]
fn test_port_binding_expressions() {
    assert_eq!(PortBinding::fixed(8000).shell_expr(), "8000");
    assert_eq!(PortBinding::from_env(8000).shell_expr(), "${PORT:-8000}");
    assert_eq!(PortBinding::from_env(8080).declared(), 8080);
}

#[test]
fn test_validate_app_target() {
    assert_eq!(validate_app_target("main:app").unwrap(), ("main", "app"));
    assert_eq!(
        validate_app_target("api.server:application").unwrap(),
        ("api.server", "application")
    );
    assert!(validate_app_target("main").is_err());
    assert!(validate_app_target("main:").is_err());
    assert!(validate_app_target("1main:app").is_err());
    assert!(validate_app_target("my-app:app").is_err());
}

#[test]
fn test_check_entry_point_found() {
    let dir = tempdir().unwrap();
    fs::write(
        dir.path().join("main.py"),
        "from fastapi import FastAPI\n\napp = FastAPI(title=\"demo\")\n",
    )
    .unwrap();

    assert!(check_entry_point(dir.path(), "main:app").is_ok());
}

#[test]
fn test_check_entry_point_package_module() {
    let dir = tempdir().unwrap();
    fs::create_dir_all(dir.path().join("api")).unwrap();
    fs::write(
        dir.path().join("api").join("__init__.py"),
        "from api.factory import create_app as app\n",
    )
    .unwrap();

    assert!(check_entry_point(dir.path(), "api:app").is_ok());
}

#[test]
fn test_check_entry_point_missing_module() {
    let dir = tempdir().unwrap();
    let err = check_entry_point(dir.path(), "main:app").unwrap_err();
    assert!(err.to_string().contains("not found"));
}

#[test]
fn test_check_entry_point_missing_attribute() {
    let dir = tempdir().unwrap();
    fs::write(
        dir.path().join("main.py"),
        "application = object()\n\ndef build():\n    app = None\n    return app\n",
    )
    .unwrap();

    let err = check_entry_point(dir.path(), "main:app").unwrap_err();
    assert!(err.to_string().contains("does not define"));
}

#[test]
fn test_shell_word_quoting() {
    assert_eq!(shell_word("main:app"), "main:app");
    assert_eq!(shell_word("${PORT:-8000}"), "${PORT:-8000}");
    assert_eq!(shell_word("*"), "'*'");
}
