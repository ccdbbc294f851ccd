//! CLI command definitions, routing, and tracing setup.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use conveyor_builder::{
    BroadcastEvents, Builder, BuildEvent, CodeBuildBackend, GitHubStatusClient,
    RemoteBuildExecutor, TracingStats,
};
use conveyor_core::{
    Conveyor, LoggingLifecycle, NewBuild, Sinks, decorate, log_channel, logger_factory,
    open_log_transport, parse_endpoint,
};
use conveyor_logs::{CloudWatchTransport, LogChannel, WriterLogger, copy};
use conveyor_shared::{
    AppConfig, ExecutorConfig, LogConfig, PoolConfig, SystemClock, UuidGenerator, github_token,
    init_config, load_config,
};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// Conveyor: container image builds for GitHub repositories.
#[derive(Parser)]
#[command(
    name = "conveyor",
    version,
    about = "Build container images from GitHub pushes on a managed build service.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run build workers, enqueueing GitHub push payloads read from stdin
    /// (one JSON document per line).
    Worker {
        /// Number of workers (overrides config).
        #[arg(short, long)]
        workers: Option<usize>,
    },

    /// Build one commit and stream its logs.
    Build {
        /// Repository in owner/name form.
        repository: String,

        /// Commit SHA to build.
        sha: String,

        /// Branch the commit belongs to.
        #[arg(short, long, default_value = "master")]
        branch: String,

        /// Do not pull cached layers.
        #[arg(long)]
        no_cache: bool,
    },

    /// Print the logs of a build, following them until the build finishes.
    Logs {
        /// Build ID.
        build_id: String,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "conveyor=info",
        1 => "conveyor=debug",
        _ => "conveyor=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Worker { workers } => cmd_worker(workers).await,
        Command::Build {
            repository,
            sha,
            branch,
            no_cache,
        } => {
            cmd_build(NewBuild {
                repository,
                sha,
                branch,
                no_cache,
            })
            .await
        }
        Command::Logs { build_id } => cmd_logs(&build_id).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show().await,
        },
    }
}

// ---------------------------------------------------------------------------
// Service assembly
// ---------------------------------------------------------------------------

/// Wire a [`Conveyor`] from config: CodeBuild executor, GitHub statuses,
/// and build logs on the configured transport.
async fn assemble(
    config: &AppConfig,
    pool: &PoolConfig,
    events: Arc<BroadcastEvents>,
) -> Result<(Conveyor, LogChannel)> {
    let executor_config = ExecutorConfig::from(config);
    let backend = CodeBuildBackend::new(parse_endpoint(&config.remote.endpoint)?)?;
    let remote_logs = CloudWatchTransport::new(parse_endpoint(&config.logs.endpoint)?)?;
    let executor: Arc<dyn Builder> = Arc::new(RemoteBuildExecutor::new(
        Arc::new(backend),
        Arc::new(remote_logs),
        executor_config,
    ));

    let status = GitHubStatusClient::new(
        parse_endpoint(&config.github.api_base)?,
        github_token(config)?,
        config.github.context.clone(),
    )?;
    let sinks = Sinks {
        status: Arc::new(status),
        stats: Arc::new(TracingStats),
        events,
        clock: Arc::new(SystemClock),
    };

    let log_config = LogConfig::from(config);
    let channel = log_channel(open_log_transport(&log_config, false).await?, &log_config);
    let loggers = logger_factory(channel.clone(), &log_config);

    let conveyor = Conveyor::new(
        decorate(executor, &sinks),
        Arc::new(loggers),
        Arc::new(LoggingLifecycle),
        Arc::new(UuidGenerator),
        pool,
    );
    Ok((conveyor, channel))
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_worker(workers: Option<usize>) -> Result<()> {
    let config = load_config()?;
    let mut pool = PoolConfig::from(&config);
    if let Some(n) = workers {
        pool.workers = n.max(1);
    }

    let (mut conveyor, _) = assemble(&config, &pool, Arc::new(BroadcastEvents::default())).await?;
    conveyor.start();
    info!(workers = pool.workers, "worker ready, reading push events from stdin");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }
        match conveyor.handle_push(line.as_bytes()).await {
            Ok(Some(opts)) => println!("{}", opts.id),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "rejected push event"),
        }
    }

    conveyor.shutdown().await?;
    Ok(())
}

async fn cmd_build(build: NewBuild) -> Result<()> {
    let config = load_config()?;
    let pool = PoolConfig {
        workers: 1,
        queue_capacity: 1,
        ..PoolConfig::from(&config)
    };

    let events = Arc::new(BroadcastEvents::default());
    let mut rx = events.subscribe();
    let (mut conveyor, channel) = assemble(&config, &pool, events).await?;
    conveyor.start();

    let opts = conveyor.enqueue(build).await?;
    eprintln!("Build {} enqueued", opts.id);

    let mut reader = channel.open(&opts.id.to_string());
    let mut stdout = WriterLogger::new(tokio::io::stdout());
    let streaming = copy(&mut reader, &mut stdout);

    let completed = async {
        loop {
            match rx.recv().await {
                Ok(BuildEvent::Completed { id, image, error, .. }) if id == opts.id => {
                    return (image, error);
                }
                Ok(_) => {}
                Err(e) => return (None, Some(format!("event stream closed: {e}"))),
            }
        }
    };

    let (streamed, (image, error)) = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            conveyor.shutdown().await?;
            return Err(eyre!("build {} interrupted", opts.id));
        }
        outcome = async { tokio::join!(streaming, completed) } => outcome,
    };
    conveyor.shutdown().await?;
    streamed?;

    match (image, error) {
        (Some(image), _) => {
            eprintln!("Built {image}");
            Ok(())
        }
        (None, Some(error)) => Err(eyre!("build {} failed: {error}", opts.id)),
        (None, None) => Err(eyre!("build {} produced no image", opts.id)),
    }
}

async fn cmd_logs(build_id: &str) -> Result<()> {
    let config = load_config()?;
    let log_config = LogConfig::from(&config);
    let transport = open_log_transport(&log_config, true).await?;
    let channel = log_channel(transport, &log_config);

    let mut reader = channel.open(build_id);
    let mut stdout = WriterLogger::new(tokio::io::stdout());
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        copied = copy(&mut reader, &mut stdout) => {
            copied?;
        }
    }
    Ok(())
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}
