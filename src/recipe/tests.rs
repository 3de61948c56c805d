use super::*;
use crate::config::Config;
use crate::pipeline::Pipeline;

fn hardened() -> (Config, Recipe) {
    let config = Config::default();
    let recipe = Pipeline::new(Profile::Hardened, &config).recipe().unwrap();
    (config, recipe)
}

fn rules<'a>(config: &'a Config, logs_dir: &'a str, profile: Profile) -> RecipeRules<'a> {
    RecipeRules {
        profile,
        workdir: &config.workdir,
        logs_dir,
        build_packages: &config.packages.build,
        healthcheck: profile.declares_healthcheck(),
    }
}

fn final_instructions(recipe: &mut Recipe) -> &mut Vec<Instruction> {
    &mut recipe.stages.last_mut().unwrap().instructions
}

#[test]
fn test_render_instructions() {
    assert_eq!(
        Instruction::Run(vec!["apt-get update".into(), "rm -rf /tmp/x".into()]).to_string(),
        "RUN apt-get update \\\n    && rm -rf /tmp/x"
    );
    assert_eq!(
        Instruction::Env(vec![
            ("A".into(), "1".into()),
            ("B".into(), "two words".into())
        ])
        .to_string(),
        "ENV A=1 \\\n    B=\"two words\""
    );
    assert_eq!(
        Instruction::Copy {
            from: Some("builder".into()),
            chown: Some("1000:1000".into()),
            sources: vec!["/root/.local".into()],
            dest: "/home/appuser/.local".into(),
        }
        .to_string(),
        "COPY --from=builder --chown=1000:1000 /root/.local /home/appuser/.local"
    );
    assert_eq!(
        Instruction::Cmd(CommandForm::Exec(vec!["uvicorn".into(), "main:app".into()]))
            .to_string(),
        "CMD [\"uvicorn\", \"main:app\"]"
    );
    assert_eq!(
        Instruction::Arg {
            name: "ENVIRONMENT".into(),
            default: None
        }
        .to_string(),
        "ARG ENVIRONMENT"
    );
}

#[test]
fn test_stage_header() {
    let mut stage = Stage::named("python:3.11-slim", "builder");
    stage.push(Instruction::Workdir("/build".into()));
    assert_eq!(
        stage.to_string(),
        "FROM python:3.11-slim AS builder\nWORKDIR /build\n"
    );
}

#[test]
fn test_is_root_identity() {
    assert!(is_root_identity("root"));
    assert!(is_root_identity("0"));
    assert!(is_root_identity("0:0"));
    assert!(is_root_identity("root:appuser"));
    assert!(!is_root_identity("appuser"));
    assert!(!is_root_identity("1000:1000"));
    assert!(!is_root_identity("rootless"));
}

#[test]
fn test_installed_packages() {
    assert_eq!(
        installed_packages("apt-get install -y --no-install-recommends gcc libpq-dev"),
        vec!["gcc", "libpq-dev"]
    );
    assert_eq!(installed_packages("apk add --no-cache curl"), vec!["curl"]);
    assert!(installed_packages("pip install gcc").is_empty());
}

#[test]
fn test_empty_recipe_is_invalid() {
    let config = Config::default();
    let logs = config.logs_dir();
    let err = Recipe::new()
        .validate(&rules(&config, &logs, Profile::Minimal))
        .unwrap_err();
    assert!(err.to_string().contains("no stages"));
}

#[test]
fn test_switch_back_to_root_is_rejected() {
    let (config, mut recipe) = hardened();
    let logs = config.logs_dir();
    let instructions = final_instructions(&mut recipe);
    let cmd = instructions.pop().unwrap();
    instructions.push(Instruction::User("root".into()));
    instructions.push(cmd);

    let err = recipe
        .validate(&rules(&config, &logs, Profile::Hardened))
        .unwrap_err();
    assert!(err.to_string().contains("privileged user"));
}

#[test]
fn test_missing_user_switch_is_rejected() {
    let (config, mut recipe) = hardened();
    let logs = config.logs_dir();
    final_instructions(&mut recipe).retain(|i| !matches!(i, Instruction::User(_)));

    let err = recipe
        .validate(&rules(&config, &logs, Profile::Hardened))
        .unwrap_err();
    assert!(err.to_string().contains("never switches"));
}

#[test]
fn test_chown_after_user_switch_is_rejected() {
    let (config, mut recipe) = hardened();
    let logs = config.logs_dir();
    let instructions = final_instructions(&mut recipe);

    // Move the USER instruction in front of the privilege preparation RUN
    let user_idx = instructions
        .iter()
        .position(|i| matches!(i, Instruction::User(_)))
        .unwrap();
    let user = instructions.remove(user_idx);
    let run_idx = instructions
        .iter()
        .position(|i| matches!(i, Instruction::Run(cmds) if cmds.iter().any(|c| c.starts_with("chown -R"))))
        .unwrap();
    instructions.insert(run_idx, user);

    let err = recipe
        .validate(&rules(&config, &logs, Profile::Hardened))
        .unwrap_err();
    assert!(err.to_string().contains("before switching"));
}

#[test]
fn test_missing_builder_copy_is_rejected() {
    let (config, mut recipe) = hardened();
    let logs = config.logs_dir();
    final_instructions(&mut recipe)
        .retain(|i| !matches!(i, Instruction::Copy { from: Some(_), .. }));

    let err = recipe
        .validate(&rules(&config, &logs, Profile::Hardened))
        .unwrap_err();
    assert!(err.to_string().contains("copy resolved dependencies"));
}

#[test]
fn test_cmd_must_be_last() {
    let (config, mut recipe) = hardened();
    let logs = config.logs_dir();
    final_instructions(&mut recipe).push(Instruction::Expose(9000));

    let err = recipe
        .validate(&rules(&config, &logs, Profile::Hardened))
        .unwrap_err();
    assert!(err.to_string().contains("last instruction"));
}

#[test]
fn test_platform_profile_requires_shell_form() {
    let config = Config::default();
    let logs = config.logs_dir();
    let mut recipe = Pipeline::new(Profile::PlatformManaged, &config)
        .recipe()
        .unwrap();
    let instructions = final_instructions(&mut recipe);
    instructions.pop();
    instructions.push(Instruction::Cmd(CommandForm::Exec(vec![
        "uvicorn".into(),
        "main:app".into(),
        "--port".into(),
        "8000".into(),
    ])));

    let err = recipe
        .validate(&rules(&config, &logs, Profile::PlatformManaged))
        .unwrap_err();
    assert!(err.to_string().contains("start time"));
}

#[test]
fn test_missing_healthcheck_is_rejected() {
    let (config, mut recipe) = hardened();
    let logs = config.logs_dir();
    final_instructions(&mut recipe).retain(|i| !matches!(i, Instruction::Healthcheck(_)));

    let err = recipe
        .validate(&rules(&config, &logs, Profile::Hardened))
        .unwrap_err();
    assert!(err.to_string().contains("HEALTHCHECK"));
}

#[test]
fn test_digest_is_stable() {
    let (_, recipe) = hardened();
    let (_, again) = hardened();
    assert_eq!(recipe.digest(), again.digest());
    assert!(recipe.digest().starts_with("sha256:"));
}
