use clap::{Parser, Subcommand};
use hosting::HostingProvider;
use packager::{build_package, SystemProcessRunner};
use pipeline::{
    connect_provider, PipelineDefinition, PipelineRunner, RunContext, RunReport, SecretStore,
    StepOutcome, TriggerEvent,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

/// Definition file picked up from the source root when `--config` is absent
const DEFAULT_DEFINITION_FILE: &str = "webship.toml";

#[derive(Parser)]
#[command(name = "webship")]
#[command(about = "Build, package and deploy a Python web app to App Service")]
struct Cli {
    /// Pipeline definition (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    /// Application source directory
    #[arg(short, long, global = true, default_value = ".")]
    source: PathBuf,
    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the whole pipeline for an event
    Run {
        /// push, workflow_dispatch or any other event name
        #[arg(short, long, default_value = "workflow_dispatch")]
        event: String,
        /// Pushed ref, e.g. refs/heads/main
        #[arg(long)]
        git_ref: Option<String>,
        /// Build and package, but do not deploy
        #[arg(long)]
        dry_run: bool,
        /// Print the run report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Build the virtual environment, startup file and archive
    Package,
    /// Print the startup command
    Startup {
        /// Also write it to the startup file
        #[arg(short, long)]
        write: bool,
    },
    /// Check whether an event would start a run
    Trigger {
        #[arg(short, long)]
        event: String,
        #[arg(long)]
        git_ref: Option<String>,
    },
    /// Deploy an existing archive
    Deploy {
        /// Defaults to the configured archive in the source directory
        #[arg(short, long)]
        archive: Option<PathBuf>,
    },
    /// Validate a publish profile without deploying
    Profile {
        /// Read the profile from a file instead of the environment
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
    /// Check that the deployed application answers
    Health,
    /// Print the effective pipeline definition
    Config,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let definition = load_definition(cli.config.as_deref(), &cli.source)?;
    let secrets = SecretStore::from_env(&[definition.deploy.publish_profile_env.as_str()]);

    match cli.command {
        Commands::Run {
            event,
            git_ref,
            dry_run,
            json,
        } => {
            let event = TriggerEvent::from_name(&event, git_ref);
            run_pipeline(definition, secrets, &cli.source, event, dry_run, json).await?;
        }
        Commands::Package => {
            package(&definition, &cli.source).await?;
        }
        Commands::Startup { write } => {
            println!("{}", definition.startup.render());
            if write {
                let path = definition
                    .startup
                    .write_to(&cli.source, &definition.package.startup_file)?;
                info!("Wrote {}", path.display());
            }
        }
        Commands::Trigger { event, git_ref } => {
            let event = TriggerEvent::from_name(&event, git_ref);
            if definition.triggers.matches(&event) {
                println!("{} triggers {}", event, definition.name);
            } else {
                println!("{} does not trigger {}", event, definition.name);
            }
        }
        Commands::Deploy { archive } => {
            let archive =
                archive.unwrap_or_else(|| cli.source.join(&definition.package.archive_name));
            deploy(&definition, &secrets, &archive).await?;
        }
        Commands::Profile { file } => {
            check_profile(&definition, secrets, file.as_deref())?;
        }
        Commands::Health => {
            health_check(&definition, &secrets).await?;
        }
        Commands::Config => {
            print!("{}", definition.to_toml()?);
        }
    }

    Ok(())
}

fn load_definition(
    config: Option<&Path>,
    source: &Path,
) -> Result<PipelineDefinition, Box<dyn std::error::Error>> {
    let fallback = source.join(DEFAULT_DEFINITION_FILE);
    let path = config.or_else(|| fallback.is_file().then_some(fallback.as_path()));

    let mut definition = PipelineDefinition::load_or_default(path)?;
    definition.apply_env_overrides(|key| std::env::var(key).ok());
    definition.validate()?;

    debug!("Effective definition: {:?}", definition);
    Ok(definition)
}

async fn run_pipeline(
    definition: PipelineDefinition,
    secrets: SecretStore,
    source: &Path,
    event: TriggerEvent,
    dry_run: bool,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut ctx = RunContext::new(source, definition, Arc::new(SystemProcessRunner), secrets)
        .with_event(event)
        .with_dry_run(dry_run);

    let report = PipelineRunner::default().run(&mut ctx).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    match report.failed_step() {
        Some(step) => Err(format!("Run {} at step {}", report.status, step.name).into()),
        None => Ok(()),
    }
}

fn print_report(report: &RunReport) {
    println!("{} [{}]: {}", report.pipeline, report.event, report.status);
    for step in &report.steps {
        let (mark, detail) = match &step.outcome {
            StepOutcome::Succeeded { summary } => ("✓", summary.as_str()),
            StepOutcome::Warned { message } => ("!", message.as_str()),
            StepOutcome::Skipped { reason } => ("-", reason.as_str()),
            StepOutcome::Failed { error } => ("✗", error.as_str()),
        };
        println!("  {} {} ({}ms) {}", mark, step.name, step.duration_ms, detail);
    }

    if let Some(revision) = &report.revision {
        println!("Revision: {}", revision.commit);
    }
    if let Some(receipt) = &report.receipt {
        println!("Deployed: {} ({})", receipt.site_url, receipt.state);
    }
}

async fn package(
    definition: &PipelineDefinition,
    source: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    let output = build_package(
        &SystemProcessRunner,
        source,
        &definition.python_version,
        &definition.package,
        &definition.startup,
    )
    .await?;

    println!("Interpreter: {} ({})", output.interpreter.program, output.interpreter.version);
    println!("Startup file: {}", output.startup_path.display());
    println!(
        "Archive: {} ({} files, {} bytes)",
        output.archive.path.display(),
        output.archive.file_count,
        output.archive.total_bytes
    );
    Ok(())
}

async fn deploy(
    definition: &PipelineDefinition,
    secrets: &SecretStore,
    archive: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    let provider = connect_provider(definition, secrets)?;
    let receipt = provider.deploy_package(archive).await?;

    println!(
        "✓ Deployed {} to {} ({})",
        archive.display(),
        receipt.site_url,
        receipt.deployment_id.as_deref().unwrap_or("no deployment id")
    );
    if let Some(log_url) = &receipt.log_url {
        println!("  Log: {}", log_url);
    }
    Ok(())
}

fn check_profile(
    definition: &PipelineDefinition,
    secrets: SecretStore,
    file: Option<&Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    let secrets = match file {
        Some(path) => {
            let xml = std::fs::read_to_string(path)?;
            secrets.with(definition.deploy.publish_profile_env.clone(), xml)
        }
        None => secrets,
    };

    match connect_provider(definition, &secrets) {
        Ok(provider) => {
            let profile = provider.profile();
            println!("✓ Publish profile is valid");
            println!("  Profile: {}", profile.profile_name);
            println!("  Method: {}", profile.publish_method);
            println!("  App: {}", profile.app_name());
            println!("  Deploy endpoint: {}", provider.scm_url());
            println!("  Site: {}", provider.site_url());
            Ok(())
        }
        Err(e) => {
            println!("✗ Publish profile rejected: {}", e);
            error!("Publish profile rejected: {}", e);
            Err(e.into())
        }
    }
}

async fn health_check(
    definition: &PipelineDefinition,
    secrets: &SecretStore,
) -> Result<(), Box<dyn std::error::Error>> {
    let provider = connect_provider(definition, secrets)?;
    println!("Checking {}...", provider.site_url());

    let report = provider.health_check().await?;
    if report.healthy {
        println!("✓ {} answered {} in {}ms", report.url, report.status, report.latency_ms);
        info!("Health check successful");
        Ok(())
    } else {
        println!("✗ {} answered {}", report.url, report.status);
        Err(format!("Health check failed with status {}", report.status).into())
    }
}
