use async_trait::async_trait;
use mockito::Matcher;
use packager::{PackagerResult, ProcessOutput, ProcessRunner, ProcessSpec};
use pipeline::{
    PipelineDefinition, PipelineRunner, RunContext, RunStatus, SecretStore, StepOutcome,
    TriggerEvent,
};
use serial_test::serial;
use std::fs;
use std::io::Read;
use std::path::Path;
use std::sync::{Arc, Mutex};

const PROFILE_ENV: &str = "AZURE_WEBAPP_PUBLISH_PROFILE";

const PROFILE_XML: &str = r#"<publishData>
  <publishProfile profileName="invoice-api - Zip Deploy" publishMethod="ZipDeploy"
    publishUrl="invoice-api.scm.azurewebsites.net:443" userName="$invoice-api"
    userPWD="hunter2" destinationAppUrl="https://invoice-api.azurewebsites.net" />
</publishData>"#;

/// Answers `--version` with Python 3.11 and lays out a venv on `-m venv`
#[derive(Default)]
struct FakeToolchain {
    calls: Mutex<Vec<String>>,
}

impl FakeToolchain {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProcessRunner for FakeToolchain {
    async fn run(&self, spec: &ProcessSpec) -> PackagerResult<ProcessOutput> {
        self.calls.lock().unwrap().push(spec.display());

        if spec.args == ["--version"] {
            return Ok(ProcessOutput::success().with_stdout("Python 3.11.9\n"));
        }

        if spec.args.starts_with(&["-m".to_string(), "venv".to_string()]) {
            let cwd = spec.cwd.as_deref().unwrap_or(Path::new("."));
            let venv = cwd.join(&spec.args[2]);
            fs::create_dir_all(venv.join("bin")).unwrap();
            fs::write(venv.join("bin/python"), "#!/bin/sh\n").unwrap();
        }

        Ok(ProcessOutput::success())
    }
}

fn checkout() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("main.py"), "app = object()\n").unwrap();
    fs::write(dir.path().join("requirements.txt"), "fastapi\ngunicorn\n").unwrap();
    fs::write(dir.path().join(".env"), "COSMOS_KEY=local\n").unwrap();
    fs::create_dir_all(dir.path().join("routers")).unwrap();
    fs::write(dir.path().join("routers/invoices.py"), "").unwrap();
    dir
}

fn definition_for(server: &mockito::Server) -> PipelineDefinition {
    let mut definition = PipelineDefinition {
        app_name: Some("invoice-api".to_string()),
        ..PipelineDefinition::default()
    };
    definition.deploy.scm_url = Some(server.url());
    definition.deploy.site_url = Some(server.url());
    definition.deploy.poll_interval_secs = 1;
    definition.deploy.max_poll_attempts = 3;
    definition
}

fn archive_entries(path: &Path) -> Vec<String> {
    let mut archive = zip::ZipArchive::new(fs::File::open(path).unwrap()).unwrap();
    (0..archive.len())
        .map(|i| archive.by_index(i).unwrap().name().to_string())
        .collect()
}

fn archive_file(path: &Path, name: &str) -> String {
    let mut archive = zip::ZipArchive::new(fs::File::open(path).unwrap()).unwrap();
    let mut contents = String::new();
    archive
        .by_name(name)
        .unwrap()
        .read_to_string(&mut contents)
        .unwrap();
    contents
}

#[tokio::test]
async fn test_push_to_main_builds_and_deploys() {
    let mut server = mockito::Server::new_async().await;
    let upload = server
        .mock("POST", "/api/zipdeploy")
        .match_query(Matcher::UrlEncoded("isAsync".into(), "true".into()))
        .match_header("content-type", "application/zip")
        .with_status(202)
        .with_header("location", "/api/deployments/3f2a")
        .create_async()
        .await;
    let status = server
        .mock("GET", "/api/deployments/3f2a")
        .with_status(200)
        .with_body(r#"{"id":"3f2a","status":4,"complete":true}"#)
        .create_async()
        .await;
    let site = server
        .mock("GET", "/")
        .with_status(200)
        .with_body("ok")
        .create_async()
        .await;

    let source = checkout();
    let toolchain = Arc::new(FakeToolchain::default());
    let secrets = SecretStore::new().with(PROFILE_ENV, PROFILE_XML);
    let mut ctx = RunContext::new(
        source.path(),
        definition_for(&server),
        toolchain.clone(),
        secrets,
    )
    .with_event(TriggerEvent::push("refs/heads/main"));

    let report = PipelineRunner::default().run(&mut ctx).await;

    assert_eq!(report.status, RunStatus::Succeeded, "{:#?}", report.steps);
    assert_eq!(report.steps.len(), 7);
    for step in &report.steps {
        assert!(
            matches!(step.outcome, StepOutcome::Succeeded { .. }),
            "{} did not succeed: {:?}",
            step.name,
            step.outcome
        );
    }

    let receipt = report.receipt.as_ref().unwrap();
    assert_eq!(receipt.deployment_id.as_deref(), Some("3f2a"));
    assert!(report.health.as_ref().unwrap().healthy);

    let archive = report.archive.clone().unwrap();
    assert_eq!(archive, source.path().join("release.zip"));
    let entries = archive_entries(&archive);
    assert!(entries.contains(&"main.py".to_string()));
    assert!(entries.contains(&"startup.txt".to_string()));
    assert!(entries.contains(&"routers/invoices.py".to_string()));
    assert!(entries.iter().all(|e| !e.starts_with("venv")), "{:?}", entries);
    assert!(!entries.contains(&".env".to_string()));
    assert!(!entries.contains(&"release.zip".to_string()));
    assert_eq!(
        archive_file(&archive, "startup.txt"),
        "gunicorn --workers 4 --worker-class uvicorn.workers.UvicornWorker \
         --timeout 600 --graceful-timeout 600 --bind 0.0.0.0:8000 main:app\n"
    );

    let calls = toolchain.calls();
    assert!(calls[0].ends_with("--version"));
    assert!(calls.iter().any(|c| c.contains("-m venv venv")));
    assert!(calls.iter().any(|c| c.contains("pip install -r requirements.txt")));

    upload.assert_async().await;
    status.assert_async().await;
    site.assert_async().await;
}

#[tokio::test]
async fn test_dry_run_never_contacts_platform() {
    let mut server = mockito::Server::new_async().await;
    let upload = server
        .mock("POST", "/api/zipdeploy")
        .match_query(Matcher::Any)
        .expect(0)
        .create_async()
        .await;

    let source = checkout();
    let secrets = SecretStore::new().with(PROFILE_ENV, PROFILE_XML);
    let mut ctx = RunContext::new(
        source.path(),
        definition_for(&server),
        Arc::new(FakeToolchain::default()),
        secrets,
    )
    .with_dry_run(true);

    let report = PipelineRunner::default().run(&mut ctx).await;

    assert_eq!(report.status, RunStatus::Succeeded);
    assert!(report.dry_run);
    assert!(source.path().join("release.zip").is_file());
    assert!(matches!(
        report.step("deploy").unwrap().outcome,
        StepOutcome::Skipped { .. }
    ));
    assert!(matches!(
        report.step("health-check").unwrap().outcome,
        StepOutcome::Skipped { .. }
    ));
    assert!(report.receipt.is_none());
    upload.assert_async().await;
}

#[tokio::test]
async fn test_invalid_publish_profile_leaves_app_untouched() {
    let mut server = mockito::Server::new_async().await;
    let upload = server
        .mock("POST", "/api/zipdeploy")
        .match_query(Matcher::Any)
        .expect(0)
        .create_async()
        .await;
    let site = server.mock("GET", "/").expect(0).create_async().await;

    for secrets in [
        SecretStore::new(),
        SecretStore::new().with(PROFILE_ENV, "not a publish profile"),
        SecretStore::new().with(
            PROFILE_ENV,
            r#"<publishData><publishProfile publishMethod="ZipDeploy" publishUrl="x:443" /></publishData>"#,
        ),
    ] {
        let source = checkout();
        let mut ctx = RunContext::new(
            source.path(),
            definition_for(&server),
            Arc::new(FakeToolchain::default()),
            secrets,
        );

        let report = PipelineRunner::default().run(&mut ctx).await;

        assert_eq!(report.status, RunStatus::Failed);
        assert_eq!(report.failed_step().unwrap().name, "deploy");
        assert!(matches!(
            report.step("package").unwrap().outcome,
            StepOutcome::Succeeded { .. }
        ));
        assert!(matches!(
            report.step("health-check").unwrap().outcome,
            StepOutcome::Skipped { .. }
        ));
        assert!(report.receipt.is_none());
    }

    upload.assert_async().await;
    site.assert_async().await;
}

#[tokio::test]
async fn test_push_to_other_branch_does_nothing() {
    let source = checkout();
    let toolchain = Arc::new(FakeToolchain::default());
    let mut ctx = RunContext::new(
        source.path(),
        PipelineDefinition::default(),
        toolchain.clone(),
        SecretStore::new().with(PROFILE_ENV, PROFILE_XML),
    )
    .with_event(TriggerEvent::push("refs/heads/feature/login"));

    let report = PipelineRunner::default().run(&mut ctx).await;

    assert_eq!(report.status, RunStatus::NotTriggered);
    assert!(report.steps.is_empty());
    assert!(toolchain.calls().is_empty());
    assert!(!source.path().join("release.zip").exists());
    assert!(!source.path().join("startup.txt").exists());
}

#[tokio::test]
async fn test_failed_install_stops_before_packaging() {
    struct BrokenPip;

    #[async_trait]
    impl ProcessRunner for BrokenPip {
        async fn run(&self, spec: &ProcessSpec) -> PackagerResult<ProcessOutput> {
            if spec.args == ["--version"] {
                return Ok(ProcessOutput::success().with_stdout("Python 3.11.9\n"));
            }
            if spec.args.contains(&"-r".to_string()) {
                return Ok(ProcessOutput::failure(1, "No matching distribution found"));
            }
            Ok(ProcessOutput::success())
        }
    }

    let source = checkout();
    let mut ctx = RunContext::new(
        source.path(),
        PipelineDefinition::default(),
        Arc::new(BrokenPip),
        SecretStore::new(),
    );

    let report = PipelineRunner::default().run(&mut ctx).await;

    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.failed_step().unwrap().name, "install-dependencies");
    match &report.step("install-dependencies").unwrap().outcome {
        StepOutcome::Failed { error } => assert!(error.contains("No matching distribution")),
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert!(!source.path().join("release.zip").exists());
}

#[test]
#[serial]
fn test_environment_configures_run() {
    std::env::set_var(PROFILE_ENV, PROFILE_XML);
    std::env::set_var("AZURE_WEBAPP_NAME", "invoice-api");
    std::env::set_var("PYTHON_VERSION", "3.12");

    let secrets = SecretStore::from_env(&[PROFILE_ENV]);
    let mut definition = PipelineDefinition::default();
    definition.apply_env_overrides(|key| std::env::var(key).ok());

    std::env::remove_var(PROFILE_ENV);
    std::env::remove_var("AZURE_WEBAPP_NAME");
    std::env::remove_var("PYTHON_VERSION");

    assert_eq!(secrets.get(PROFILE_ENV), Some(PROFILE_XML));
    assert_eq!(definition.app_name.as_deref(), Some("invoice-api"));
    assert_eq!(definition.python_version, "3.12");

    let provider = pipeline::connect_provider(&definition, &secrets).unwrap();
    assert_eq!(provider.scm_url(), "https://invoice-api.scm.azurewebsites.net");
}

#[test]
#[serial]
fn test_missing_environment_leaves_defaults() {
    std::env::remove_var(PROFILE_ENV);
    std::env::remove_var("AZURE_WEBAPP_NAME");

    let secrets = SecretStore::from_env(&[PROFILE_ENV]);
    let mut definition = PipelineDefinition::default();
    definition.apply_env_overrides(|key| std::env::var(key).ok());

    assert_eq!(secrets.get(PROFILE_ENV), None);
    assert_eq!(definition.app_name, None);
    assert!(pipeline::connect_provider(&definition, &secrets).is_err());
}
