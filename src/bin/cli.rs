//! Scalable Sandbox CLI
//!
//! Run snippets through the pooled service, inspect it, or serve the HTTP API.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use console::style;
use scalable_sandbox::config::{config_path, save_config, validate_config, ServiceConfig};
use scalable_sandbox::sandbox::{
    create_backend, ExecutionRequest, ExecutionResult, IsolationBackend, Language, ScriptedBackend,
};
use scalable_sandbox::{api, Error, ScalableSandboxService, VERSION};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(
    name = "sandbox",
    author = "Scalable Sandbox Contributors",
    version = VERSION,
    about = "Scalable Sandbox - pooled, cached execution of untrusted code snippets",
    long_about = None
)]
struct Cli {
    /// Use this config file instead of the default location
    #[arg(long, global = true, env = "SANDBOX_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute one snippet
    Run {
        /// Programming language
        language: String,
        /// Code to execute
        code: String,
        /// Bypass the result cache
        #[arg(long)]
        no_cache: bool,
        /// Wall-clock limit, e.g. "5s"
        #[arg(long, value_parser = humantime_serde::re::humantime::parse_duration)]
        timeout: Option<Duration>,
        /// Session id for sticky routing
        #[arg(long)]
        session: Option<String>,
        /// Use the scripted backend instead of real interpreters
        #[arg(long)]
        dry_run: bool,
    },

    /// Execute a JSON array of requests
    Batch {
        /// File with a JSON array of execution requests
        file: PathBuf,
        /// Use the scripted backend instead of real interpreters
        #[arg(long)]
        dry_run: bool,
    },

    /// Show configuration, pool and health status
    Status,

    /// Write a default configuration file
    InitConfig {
        /// Destination (defaults to the standard config path)
        #[arg(long)]
        path: Option<PathBuf>,
        /// Overwrite an existing file
        #[arg(long, short)]
        force: bool,
    },

    /// Serve the HTTP API until Ctrl-C
    Serve {
        /// Bind address (overrides config)
        #[arg(long)]
        bind: Option<String>,
        /// Port (overrides config)
        #[arg(long, short)]
        port: Option<u16>,
        /// Use the scripted backend instead of real interpreters
        #[arg(long)]
        dry_run: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("scalable_sandbox=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            language,
            code,
            no_cache,
            timeout,
            session,
            dry_run,
        } => {
            let mut request = ExecutionRequest::new(code, language.parse::<Language>()?);
            if no_cache {
                request = request.uncacheable();
            }
            if let Some(timeout) = timeout {
                request = request.with_timeout(timeout);
            }
            if let Some(session) = session {
                request = request.with_session(session);
            }
            run_code(cli.config.as_deref(), request, dry_run).await
        }
        Commands::Batch { file, dry_run } => run_batch(cli.config.as_deref(), &file, dry_run).await,
        Commands::Status => show_status(cli.config.as_deref()).await,
        Commands::InitConfig { path, force } => init_config(path, force),
        Commands::Serve {
            bind,
            port,
            dry_run,
        } => serve(cli.config.as_deref(), bind, port, dry_run).await,
    }
}

fn load(path: Option<&Path>) -> anyhow::Result<ServiceConfig> {
    let config = match path {
        Some(path) => {
            let mut config = scalable_sandbox::config::load_config_from_path(path)?;
            scalable_sandbox::config::apply_env_overrides(&mut config);
            config
        }
        None => ServiceConfig::from_env()?,
    };
    Ok(config)
}

fn build_service(config: ServiceConfig, dry_run: bool) -> anyhow::Result<Arc<ScalableSandboxService>> {
    let backend: Arc<dyn IsolationBackend> = if dry_run {
        Arc::new(ScriptedBackend::echo())
    } else {
        create_backend(&config.sandbox)
    };
    Ok(Arc::new(ScalableSandboxService::new(config, backend)?))
}

fn print_result(result: &ExecutionResult) {
    let served_by = if result.cache_hit {
        "cache".to_string()
    } else {
        result.instance_id.clone().unwrap_or_else(|| "-".to_string())
    };

    if result.success {
        println!("{}", style("Output:").green().bold());
        println!("{}", result.stdout);
    } else {
        println!(
            "{} exit code {:?}",
            style("Failed:").red().bold(),
            result.exit_code
        );
        println!("{}", result.combined_output());
    }
    println!(
        "{}",
        style(format!(
            "{:?} on {} [{}]",
            result.duration, served_by, result.correlation_id
        ))
        .dim()
    );
}

fn print_error(err: &Error) {
    println!("{} {}", style(format!("[{}]", err.kind())).red().bold(), err);
}

/// Run one snippet and report the result
async fn run_code(config: Option<&Path>, request: ExecutionRequest, dry_run: bool) -> anyhow::Result<()> {
    let service = build_service(load(config)?, dry_run)?;
    println!("Executing {} code...\n", request.language);

    let outcome = service.execute(request).await;
    service.shutdown(Duration::from_secs(1)).await;

    match outcome {
        Ok(result) => {
            print_result(&result);
            Ok(())
        }
        Err(e) => {
            match e.untagged() {
                Error::Execution {
                    exit_code,
                    stdout,
                    stderr,
                    ..
                } => {
                    println!("{} exit code {:?}", style("Failed:").red().bold(), exit_code);
                    if !stdout.is_empty() {
                        println!("{}", stdout);
                    }
                    println!("{}", style(stderr).red());
                }
                _ => print_error(&e),
            }
            std::process::exit(1);
        }
    }
}

/// Run every request in a JSON file through the processor
async fn run_batch(config: Option<&Path>, file: &Path, dry_run: bool) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let requests: Vec<ExecutionRequest> = serde_json::from_str(&content)
        .with_context(|| format!("{} is not a JSON array of requests", file.display()))?;
    if requests.is_empty() {
        bail!("{} contains no requests", file.display());
    }

    let service = build_service(load(config)?, dry_run)?;
    let batch = service.execute_batch(requests).await;

    for (index, result) in batch.results.iter().enumerate() {
        println!("{}", style(format!("#{}", index)).cyan().bold());
        match result {
            Ok(result) => print_result(result),
            Err(e) => print_error(e),
        }
        println!();
    }
    println!(
        "Batch {}: {} succeeded, {} failed",
        batch.id,
        style(batch.succeeded()).green(),
        style(batch.failed()).red()
    );

    service.shutdown(Duration::from_secs(1)).await;
    Ok(())
}

/// Probe every instance once and print what the service sees
async fn show_status(config: Option<&Path>) -> anyhow::Result<()> {
    println!("{}\n", style("Scalable Sandbox Status").bold());

    let config = match load(config) {
        Ok(c) => c,
        Err(e) => {
            println!("Configuration: {} {}", style("invalid").red(), e);
            return Ok(());
        }
    };
    println!("Configuration: {}", style("loaded").green());
    println!("  Backend: {:?}", config.sandbox.backend);
    println!("  Strategy: {:?}", config.balancer.strategy);
    println!(
        "  Workers: {} initial, {}..={}",
        config.pool.initial_workers, config.pool.min_workers, config.pool.max_workers
    );

    let validation = validate_config(&config);
    for issue in &validation.errors {
        println!("  {} {}: {}", style("error").red(), issue.path, issue.message);
    }
    for issue in &validation.warnings {
        println!("  {} {}: {}", style("warning").yellow(), issue.path, issue.message);
    }
    if !validation.valid {
        return Ok(());
    }

    let service = build_service(config, false)?;
    service.health_monitor().check_all().await;

    let status = service.status();
    println!(
        "\nPool: {} idle, {} busy, {} unhealthy, {} draining ({} total)",
        status.pool.idle, status.pool.busy, status.pool.unhealthy, status.pool.draining, status.pool.total
    );
    for (target, health) in service.health() {
        let mark = if health.healthy {
            style("healthy").green()
        } else {
            style("unhealthy").red()
        };
        match &health.last_error {
            Some(error) => println!("  {}: {} ({})", target, mark, error),
            None => println!("  {}: {}", target, mark),
        }
    }

    service.shutdown(Duration::from_secs(1)).await;
    Ok(())
}

/// Write the default configuration to disk
fn init_config(path: Option<PathBuf>, force: bool) -> anyhow::Result<()> {
    let path = path.unwrap_or_else(config_path);
    if path.exists() && !force {
        bail!(
            "{} already exists. Use --force to overwrite.",
            path.display()
        );
    }
    save_config(&ServiceConfig::default(), &path)?;
    println!("{} {}", style("Wrote").green(), path.display());
    Ok(())
}

/// Serve the HTTP API
async fn serve(
    config: Option<&Path>,
    bind: Option<String>,
    port: Option<u16>,
    dry_run: bool,
) -> anyhow::Result<()> {
    let mut config = load(config)?;
    if let Some(bind) = bind {
        config.gateway.bind = bind;
    }
    if let Some(port) = port {
        config.gateway.port = port;
    }
    let addr: SocketAddr = format!("{}:{}", config.gateway.bind, config.gateway.port)
        .parse()
        .with_context(|| format!("Invalid bind address {}", config.gateway.bind))?;
    let grace = config.processor.shutdown_grace;

    let service = build_service(config, dry_run)?;
    service.start_background();

    println!("Serving on {}", style(format!("http://{}", addr)).cyan());
    api::serve(service.clone(), addr, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await?;

    let report = service.shutdown(grace).await;
    println!(
        "Stopped: {} completed, {} cancelled",
        report.completed, report.cancelled
    );
    Ok(())
}
