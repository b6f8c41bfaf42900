use anyhow::{Context, Result, bail};
use clap::{ArgGroup, Args, Parser, Subcommand};
use ferry::config::AppConfig;
use ferry::context::AppContext;
use ferry::core::models::{
    ArchiveFormat, HashAlgorithm, PipelineResult, RollbackOutcome, StageStatus, TargetRecord,
    validate_remote_path,
};
use ferry::core::{DeployRequest, Orchestrator, PipelineSettings};
use ferry::db;
use ferry::logging::{self, LogConfig, LogThrottle};
use ferry::session::simulated::SimulatedHost;
use ferry::session::ssh::SshConnector;
use ferry::session::{ConnectParams, Connector, Credential, RemoteSession, TransferStatus};
use serde::Serialize;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Parser)]
#[command(name = "ferry")]
#[command(about = "Archive, upload, verify and install builds on remote hosts", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (default: ferry.toml)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Route every session to a simulated host rooted at DIR
    #[arg(long, global = true, value_name = "DIR")]
    simulation: Option<PathBuf>,

    #[arg(long, short, global = true)]
    verbose: bool,

    /// Emit logs as JSON on stderr
    #[arg(long, global = true)]
    log_json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Deploy a file or directory to one or more targets
    Deploy(DeployArgs),
    /// Manage named deployment targets
    #[command(subcommand)]
    Targets(TargetCommands),
    /// Show the end of a target's log file
    Tail {
        name: String,
        #[arg(long, short = 'n', default_value_t = 50)]
        lines: usize,
    },
    /// Print a remote file from a target
    Cat { name: String, path: String },
    /// List recent runs
    History {
        name: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Print the effective configuration
    Config,
}

#[derive(Args)]
struct DeployArgs {
    source: PathBuf,

    /// Registry target; repeat to deploy to several targets at once
    #[arg(long = "target", value_name = "NAME")]
    targets: Vec<String>,

    #[command(flatten)]
    adhoc: AdHocTarget,

    #[arg(long, value_enum)]
    format: Option<ArchiveFormat>,

    #[arg(long, value_enum)]
    hash: Option<HashAlgorithm>,

    /// Extra exclude pattern, on top of the configured ones
    #[arg(long = "exclude", value_name = "PATTERN")]
    excludes: Vec<String>,

    #[arg(long)]
    no_verify: bool,

    /// Keep only the newest N backups of the target
    #[arg(long, value_name = "N")]
    keep_backups: Option<usize>,

    #[arg(long)]
    dry_run: bool,

    /// Print results as JSON
    #[arg(long)]
    json: bool,
}

/// Connection details for a deploy that does not use the registry.
#[derive(Args)]
struct AdHocTarget {
    #[arg(long, conflicts_with = "targets")]
    host: Option<String>,
    #[arg(long, default_value_t = 22)]
    port: u16,
    #[arg(long)]
    user: Option<String>,
    #[arg(long, conflicts_with = "key_file")]
    password: Option<String>,
    #[arg(long)]
    key_file: Option<PathBuf>,
    #[arg(long)]
    remote_path: Option<String>,
}

#[derive(Subcommand)]
enum TargetCommands {
    /// Add a target, replacing any target with the same name
    Add(AddTargetArgs),
    List,
    Remove { name: String },
}

#[derive(Args)]
#[command(group(ArgGroup::new("credential").required(true).args(["password", "key_file"])))]
struct AddTargetArgs {
    name: String,
    #[arg(long)]
    host: String,
    #[arg(long, default_value_t = 22)]
    port: u16,
    #[arg(long)]
    user: String,
    #[arg(long)]
    password: Option<String>,
    #[arg(long)]
    key_file: Option<PathBuf>,
    #[arg(long)]
    remote_path: String,
    /// Remote log file for `ferry tail`
    #[arg(long)]
    log_path: Option<String>,
}

/// CLI values layered over the config file and environment.
#[derive(Serialize, Default)]
struct Overrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    verbose: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    log_json: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<ArchiveFormat>,
    #[serde(skip_serializing_if = "Option::is_none")]
    hash_algorithm: Option<HashAlgorithm>,
    #[serde(skip_serializing_if = "Option::is_none")]
    verify_upload: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    backup_retention: Option<usize>,
}

impl Overrides {
    fn from_cli(cli: &Cli) -> Self {
        let mut overrides = Overrides {
            verbose: cli.verbose.then_some(true),
            log_json: cli.log_json.then_some(true),
            ..Default::default()
        };
        if let Commands::Deploy(args) = &cli.command {
            overrides.format = args.format;
            overrides.hash_algorithm = args.hash;
            overrides.verify_upload = args.no_verify.then_some(false);
            overrides.backup_retention = args.keep_backups;
        }
        overrides
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::new(cli.config.as_deref(), Some(&Overrides::from_cli(&cli)))
        .context("Failed to load configuration")?;
    logging::init(LogConfig::from(&config));

    if let Commands::Config = &cli.command {
        print!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    let connector = connector(&cli)?;
    let db_conn = db::init(&config.database_path)
        .await
        .context("Failed to open target registry")?;
    let ctx = AppContext::new(config, db_conn);

    let code = match cli.command {
        Commands::Deploy(args) => run_deploy(&ctx, connector, args).await?,
        Commands::Targets(command) => run_targets(&ctx, command).await.map(|_| 0)?,
        Commands::Tail { name, lines } => {
            let target = db::targets::require(&ctx.db, &name).await?;
            let log_path = target
                .log_path
                .clone()
                .with_context(|| format!("Target '{}' has no log path", name))?;
            let session = open_session(&ctx, connector.as_ref(), &target).await?;
            let output = session
                .read_tail(&log_path, lines, ctx.config.command_timeout())
                .await;
            close_session(session.as_ref()).await;
            print!("{}", output?);
            0
        }
        Commands::Cat { name, path } => {
            let target = db::targets::require(&ctx.db, &name).await?;
            let session = open_session(&ctx, connector.as_ref(), &target).await?;
            let output = session.read_file(&path, ctx.config.command_timeout()).await;
            close_session(session.as_ref()).await;
            print!("{}", output?);
            0
        }
        Commands::History { name, limit } => {
            for run in db::runs::list(&ctx.db, name, limit).await? {
                println!(
                    "{}  {:<12} {:<8} {:<8} exit {:<3} {}",
                    run.created_at,
                    run.target,
                    if run.success { "ok" } else { "failed" },
                    run.stage,
                    run.exit_code,
                    run.message
                );
            }
            0
        }
        Commands::Config => 0,
    };

    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

fn connector(cli: &Cli) -> Result<Arc<dyn Connector>> {
    Ok(match &cli.simulation {
        Some(root) => Arc::new(
            SimulatedHost::new(root)
                .with_context(|| format!("Failed to prepare simulated host at {}", root.display()))?,
        ),
        None => Arc::new(SshConnector),
    })
}

async fn open_session(
    ctx: &AppContext,
    connector: &dyn Connector,
    target: &TargetRecord,
) -> Result<Box<dyn RemoteSession>> {
    let params = target.connect_params(ctx.config.connect_timeout());
    connector
        .connect(&params)
        .await
        .with_context(|| format!("Failed to connect to {}", params.endpoint()))
}

async fn close_session(session: &dyn RemoteSession) {
    if let Err(e) = session.close().await {
        warn!(error = %e, "Failed to close session");
    }
}

async fn run_targets(ctx: &AppContext, command: TargetCommands) -> Result<()> {
    match command {
        TargetCommands::Add(args) => {
            db::targets::validate_name(&args.name)?;
            let remote_path = validate_remote_path(&args.remote_path)?;
            let credential = match (args.password, args.key_file) {
                (Some(password), _) => Credential::Password(password),
                (None, Some(path)) => Credential::KeyFile(path),
                (None, None) => bail!("Either --password or --key-file is required"),
            };
            let name = args.name.clone();
            db::targets::add(
                &ctx.db,
                TargetRecord {
                    name: args.name,
                    host: args.host,
                    port: args.port,
                    username: args.user,
                    credential,
                    remote_path,
                    log_path: args.log_path,
                },
            )
            .await?;
            println!("Saved target '{}'", name);
        }
        TargetCommands::List => {
            let targets = db::targets::list(&ctx.db).await?;
            if targets.is_empty() {
                println!("No targets. Add one with `ferry targets add`.");
            }
            for t in targets {
                println!(
                    "{:<12} {}@{}:{} -> {} ({})",
                    t.name,
                    t.username,
                    t.host,
                    t.port,
                    t.remote_path,
                    t.credential.kind()
                );
            }
        }
        TargetCommands::Remove { name } => {
            if db::targets::remove(&ctx.db, name.clone()).await? {
                println!("Removed target '{}'", name);
            } else {
                bail!("No target named '{}'", name);
            }
        }
    }
    Ok(())
}

/// A resolved deployment: the label used in output and history, plus the
/// request itself.
struct Planned {
    label: String,
    request: DeployRequest,
}

async fn plan_deploys(ctx: &AppContext, args: &DeployArgs) -> Result<Vec<Planned>> {
    let config = &ctx.config;
    let mut exclude_patterns = config.exclude_patterns.clone();
    exclude_patterns.extend(args.excludes.iter().cloned());

    let request = |connect: ConnectParams, remote_path: String| DeployRequest {
        source: args.source.clone(),
        format: config.format,
        exclude_patterns: exclude_patterns.clone(),
        connect,
        remote_path,
        verify: config.verify_upload,
        dry_run: args.dry_run,
    };

    if !args.targets.is_empty() {
        let mut planned = Vec::new();
        for name in &args.targets {
            let target = db::targets::require(&ctx.db, name).await?;
            validate_remote_path(&target.remote_path)?;
            planned.push(Planned {
                label: target.name.clone(),
                request: request(
                    target.connect_params(config.connect_timeout()),
                    target.remote_path.clone(),
                ),
            });
        }
        return Ok(planned);
    }

    let adhoc = &args.adhoc;
    let (Some(host), Some(user), Some(remote_path)) =
        (&adhoc.host, &adhoc.user, &adhoc.remote_path)
    else {
        bail!("Give --target NAME, or all of --host, --user and --remote-path");
    };
    let credential = match (&adhoc.password, &adhoc.key_file) {
        (Some(password), _) => Credential::Password(password.clone()),
        (None, Some(path)) => Credential::KeyFile(path.clone()),
        (None, None) => bail!("Either --password or --key-file is required"),
    };
    let connect = ConnectParams {
        host: host.clone(),
        port: adhoc.port,
        username: user.clone(),
        credential,
        timeout: config.connect_timeout(),
    };

    Ok(vec![Planned {
        label: connect.endpoint(),
        request: request(connect, validate_remote_path(remote_path)?),
    }])
}

async fn run_deploy(ctx: &AppContext, connector: Arc<dyn Connector>, args: DeployArgs) -> Result<i32> {
    let planned = plan_deploys(ctx, &args).await?;
    let orchestrator = Orchestrator::new(PipelineSettings::from(&*ctx.config), connector);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, stopping after the current step");
                cancel.cancel();
            }
        });
    }

    let show_progress = planned.len() == 1 && !args.json && !args.dry_run;
    let mut runs = JoinSet::new();
    for (index, Planned { label, request }) in planned.into_iter().enumerate() {
        let orchestrator = orchestrator.clone();
        let cancel = cancel.clone();
        let progress = show_progress.then(spawn_progress_printer);
        runs.spawn(async move {
            let result = orchestrator.run(&request, progress, &cancel).await;
            (index, label, request, result)
        });
    }

    let mut finished = Vec::new();
    while let Some(joined) = runs.join_next().await {
        finished.push(joined.context("Deployment task panicked")?);
    }
    finished.sort_by_key(|(index, ..)| *index);

    let mut exit_code = 0;
    for (_, label, request, result) in &finished {
        if !request.dry_run {
            let source = request.source.display().to_string();
            if let Err(e) = db::runs::record(&ctx.db, label.clone(), source, result).await {
                warn!(error = %e, "Failed to record run history");
            }
        }

        if args.json {
            #[derive(Serialize)]
            struct Output<'a> {
                target: &'a str,
                #[serde(flatten)]
                result: &'a PipelineResult,
            }
            println!(
                "{}",
                serde_json::to_string_pretty(&Output {
                    target: label,
                    result
                })?
            );
        } else {
            print_result(label, result);
        }

        if exit_code == 0 {
            exit_code = result.exit_code;
        }
    }

    Ok(exit_code)
}

/// Print upload progress on stderr, at most a few times a second.
fn spawn_progress_printer() -> mpsc::Sender<TransferStatus> {
    let (tx, mut rx) = mpsc::channel(32);
    tokio::spawn(async move {
        let throttle = LogThrottle::new(Duration::from_millis(250));
        let mut stderr = std::io::stderr();
        while let Some(status) = rx.recv().await {
            match status {
                TransferStatus::InProgress {
                    total_bytes,
                    bytes_sent,
                    percentage,
                } if throttle.should_log() || bytes_sent == total_bytes => {
                    let _ = write!(
                        stderr,
                        "\r  uploading {:>3}% ({}/{} bytes)",
                        percentage, bytes_sent, total_bytes
                    );
                }
                TransferStatus::Complete | TransferStatus::Failed(_) => {
                    let _ = writeln!(stderr);
                }
                _ => {}
            }
        }
    });
    tx
}

fn print_result(label: &str, result: &PipelineResult) {
    println!("== {} ==", label);
    for report in &result.stages {
        let status = match report.status {
            StageStatus::Ok => "ok",
            StageStatus::Failed => "FAILED",
            StageStatus::Skipped => "skipped",
            StageStatus::Warning => "warning",
        };
        println!("[{:<7}] {:<8} {}", status, report.stage, report.detail);
    }
    for line in &result.plan {
        println!("  would run: {}", line);
    }
    match &result.rollback {
        Some(RollbackOutcome::Restored { backup_path }) => {
            println!("rollback: restored previous content from {}", backup_path)
        }
        Some(RollbackOutcome::Removed) => println!("rollback: removed partial install"),
        Some(RollbackOutcome::Failed { reason }) => println!("rollback: FAILED, {}", reason),
        None => {}
    }
    for warning in &result.warnings {
        println!("warning: {}", warning);
    }
    if result.success {
        println!("SUCCESS: {}", result.message);
    } else {
        println!(
            "FAILED at {} (exit {}): {}",
            result.stage, result.exit_code, result.message
        );
    }
}
