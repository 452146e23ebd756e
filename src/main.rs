use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use dokploy_provision::apply::executor::TaskExecutor;
use dokploy_provision::apply::report::RunReport;
use dokploy_provision::apply::variables::{parse_extra_vars, VariableContext};
use dokploy_provision::config::{default_config_dir, ProvisionConfig};
use dokploy_provision::connection::{Connection, LocalConnection, SshConnection, SshSettings};
use dokploy_provision::error::{ProvisionError, Result};
use dokploy_provision::inventory::{ConnectionKind, CredentialRef, Target, TargetOverrides};
use dokploy_provision::playbook::{Playbook, Selection};
use dokploy_provision::roles::RoleLoader;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "dokploy-provision")]
#[command(about = "Idempotent installation and hardening of Dokploy on a single Ubuntu host")]
#[command(version)]
struct Cli {
    /// Configuration directory (default: /etc/dokploy-provision/config if it exists, otherwise ~/.config/dokploy-provision/config)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// More log output (-v info, -vv debug, -vvv trace); RUST_LOG takes precedence
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Install Docker, swarm, Dokploy and the firewall baseline (base role)
    Deploy(RunArgs),
    /// Harden a deployed host (hardening role)
    Harden(RunArgs),
    /// Run base then hardening
    Site(RunArgs),
    /// Load configuration and roles and validate every task without connecting
    Validate {
        #[command(flatten)]
        target: TargetArgs,
        /// Role combination to validate
        #[arg(long, value_enum, default_value_t = PlaybookArg::Site)]
        playbook: PlaybookArg,
        /// Extra variables, KEY=VALUE or @FILE (repeatable)
        #[arg(short = 'e', long = "extra-vars")]
        extra_vars: Vec<String>,
    },
    /// Resolve the target and check that it is reachable
    Ping {
        #[command(flatten)]
        target: TargetArgs,
    },
    /// List the available roles and their tasks
    Roles,
}

#[derive(Args)]
struct TargetArgs {
    /// Inventory target name
    #[arg(short, long, default_value = "production")]
    target: String,
    /// Target address, overriding the inventory
    #[arg(long, env = "DOKPLOY_HOST")]
    host: Option<String>,
    /// SSH user, overriding the inventory
    #[arg(long, env = "DOKPLOY_USER")]
    user: Option<String>,
    /// SSH port, overriding the inventory
    #[arg(long)]
    port: Option<u16>,
    /// Private key file
    #[arg(long)]
    private_key_file: Option<PathBuf>,
    /// Private key material; staged in a temporary file for the run
    #[arg(long, env = "DOKPLOY_SSH_KEY", hide_env_values = true)]
    private_key: Option<String>,
}

#[derive(Args)]
struct RunArgs {
    #[command(flatten)]
    target: TargetArgs,
    /// Extra variables, KEY=VALUE or @FILE (repeatable)
    #[arg(short = 'e', long = "extra-vars")]
    extra_vars: Vec<String>,
    /// Probe only and report what would change
    #[arg(long)]
    dry_run: bool,
    /// Output format for the run recap
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,
    /// Also write the JSON run report to this file
    #[arg(long)]
    report: Option<PathBuf>,
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Clone, Copy, ValueEnum)]
enum PlaybookArg {
    Deploy,
    Harden,
    Site,
}

impl From<PlaybookArg> for Selection {
    fn from(arg: PlaybookArg) -> Self {
        match arg {
            PlaybookArg::Deploy => Selection::Deploy,
            PlaybookArg::Harden => Selection::Harden,
            PlaybookArg::Site => Selection::Site,
        }
    }
}

impl TargetArgs {
    fn overrides(&self) -> TargetOverrides {
        let credential = match (&self.private_key, &self.private_key_file) {
            (Some(material), _) if !material.trim().is_empty() => {
                Some(CredentialRef::KeyMaterial(material.clone()))
            }
            (_, Some(path)) => Some(CredentialRef::KeyFile(path.clone())),
            _ => None,
        };
        TargetOverrides {
            address: self.host.clone().filter(|h| !h.is_empty()),
            user: self.user.clone().filter(|u| !u.is_empty()),
            port: self.port,
            credential,
        }
    }
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{}", e);
            eprintln!("Error: {}", e);
            e.exit_code()
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32> {
    let config_dir = default_config_dir(cli.config);

    match cli.command {
        Commands::Deploy(args) => converge(&config_dir, Selection::Deploy, args).await,
        Commands::Harden(args) => converge(&config_dir, Selection::Harden, args).await,
        Commands::Site(args) => converge(&config_dir, Selection::Site, args).await,
        Commands::Validate {
            target,
            playbook,
            extra_vars,
        } => {
            let config = ProvisionConfig::load(&config_dir)?;
            let target = config.inventory.resolve(&target.target, &target.overrides())?;
            let (playbook, executor) =
                prepare(&config, &target, playbook.into(), &extra_vars, false)?;
            executor.validate(&playbook.tasks, &playbook.handlers)?;
            println!(
                "{}: {} tasks and {} handlers from roles {} are valid for {}",
                playbook.name,
                playbook.tasks.len(),
                playbook.handlers.len(),
                playbook.roles.join(", "),
                target.name
            );
            Ok(0)
        }
        Commands::Ping { target } => {
            let config = ProvisionConfig::load(&config_dir)?;
            let target = config.inventory.resolve(&target.target, &target.overrides())?;
            connect(&target, &config.ssh).await?;
            println!(
                "{}: reachable ({}:{})",
                target.name,
                target.destination(),
                target.port
            );
            Ok(0)
        }
        Commands::Roles => {
            let config = ProvisionConfig::load(&config_dir)?;
            let loader = RoleLoader::new(Some(config.roles_dir()));
            for name in RoleLoader::builtin_names() {
                let role = loader.load(name)?;
                println!("{}: {}", role.name, role.description);
                for task in &role.tasks {
                    println!("  - {}", task.display_name());
                }
            }
            Ok(0)
        }
    }
}

/// Compose the playbook and build an executor with the merged variables
fn prepare(
    config: &ProvisionConfig,
    target: &Target,
    selection: Selection,
    extra_vars: &[String],
    dry_run: bool,
) -> Result<(Playbook, TaskExecutor)> {
    let loader = RoleLoader::new(Some(config.roles_dir()));
    let playbook = Playbook::load(selection, &loader)?;
    let layers = playbook.variable_layers(
        target.facts(),
        config.vars.clone(),
        target.vars.clone(),
        parse_extra_vars(extra_vars)?,
    );
    let variables = VariableContext::from_layers(&layers)?;
    let executor = TaskExecutor::new(dry_run, variables, playbook.templates.clone())
        .with_labels(&playbook.name, &target.name);
    Ok((playbook, executor))
}

/// Open a connection to the target and make sure it answers
async fn connect(target: &Target, settings: &SshSettings) -> Result<Box<dyn Connection>> {
    match target.connection {
        ConnectionKind::Ssh => {
            let mut conn = SshConnection::open(target, settings)
                .map_err(|e| ProvisionError::Config(format!("{:#}", e)))?;
            conn.check_reachable().await?;
            Ok(Box::new(conn))
        }
        ConnectionKind::Local => {
            let conn = LocalConnection::new(&target.name, target.needs_sudo());
            match conn.exec("true", None).await {
                Ok(output) if output.success() => Ok(Box::new(conn)),
                Ok(output) => Err(ProvisionError::Unreachable {
                    target: target.name.clone(),
                    reason: output.stderr.trim().to_string(),
                }),
                Err(e) => Err(ProvisionError::Unreachable {
                    target: target.name.clone(),
                    reason: format!("{:#}", e),
                }),
            }
        }
    }
}

async fn converge(config_dir: &std::path::Path, selection: Selection, args: RunArgs) -> Result<i32> {
    let config = ProvisionConfig::load(config_dir)?;
    let target = config
        .inventory
        .resolve(&args.target.target, &args.target.overrides())?;
    let (playbook, executor) =
        prepare(&config, &target, selection, &args.extra_vars, args.dry_run)?;
    executor.validate(&playbook.tasks, &playbook.handlers)?;

    let conn = connect(&target, &config.ssh).await?;

    let abort = executor.abort_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; finishing the current task");
            abort.store(true, Ordering::SeqCst);
        }
    });

    info!(
        "Running {} ({}) against {}",
        playbook.name,
        playbook.roles.join(", "),
        target.name
    );
    let report = executor
        .apply(conn.as_ref(), &playbook.tasks, &playbook.handlers)
        .await;

    emit(&report, args.format, args.report.as_deref())?;
    Ok(report.exit_code())
}

fn emit(report: &RunReport, format: OutputFormat, path: Option<&std::path::Path>) -> Result<()> {
    match format {
        OutputFormat::Text => print!("{}", report.render_text()),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(report)?),
    }
    if let Some(path) = path {
        std::fs::write(path, serde_json::to_string_pretty(report)?)?;
        info!("Run report written to {}", path.display());
    }
    Ok(())
}
