use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use metrics_exporter_prometheus::PrometheusBuilder;
use pkgsvc_core::OperationKind;
use pkgsvc_server::network::{NetworkConfig, SocketActivation, SystemdActivation};
use pkgsvc_server::{PackageService, PinningEngineFactory, ServiceClient, ServiceConfig, ServiceTarget};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "pkgsvc",
    version,
    about = "Runs package operations one at a time per package"
)]
struct Cli {
    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Pretty, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Manage the service.
    Service {
        #[command(subcommand)]
        command: ServiceCommand,
    },
    /// Resolve the dependencies of a package.
    Resolve(OperationArgs),
    /// Build a package.
    Build(OperationArgs),
}

#[derive(Debug, Subcommand)]
enum ServiceCommand {
    /// Run the service in the foreground until interrupted.
    Start(StartArgs),
}

#[derive(Debug, Args)]
struct StartArgs {
    /// Where to listen: http://host:port or unix:///path.
    #[arg(long, env = "PKGSVC_SERVICE_URL", default_value = "http://127.0.0.1:7777")]
    service_url: ServiceTarget,

    /// Use the listener passed by systemd instead of binding one.
    #[arg(long, default_value_t = false)]
    socket_activation: bool,

    /// Name of the activated socket (`FileDescriptorName=`).
    #[arg(long, default_value = "pkgsvc")]
    socket_name: String,

    /// Stop when the pkgsvc binary is modified.
    #[arg(long, default_value_t = false)]
    stop_on_bin_mod: bool,

    /// Serve Prometheus metrics on this address.
    #[arg(long, env = "PKGSVC_METRICS_ADDR")]
    metrics_addr: Option<SocketAddr>,

    /// Seconds to wait for running operations when stopping.
    #[arg(long, default_value_t = 30)]
    drain_timeout_secs: u64,
}

#[derive(Debug, Args)]
struct OperationArgs {
    /// Service to connect to.
    #[arg(long, env = "PKGSVC_SERVICE_URL", default_value = "http://127.0.0.1:7777")]
    service_url: ServiceTarget,

    /// Package directory. Defaults to the current directory.
    #[arg(long)]
    package_path: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match run(cli.command).await {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_env("PKGSVC_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Pretty => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn run(command: Command) -> anyhow::Result<ExitCode> {
    match command {
        Command::Service {
            command: ServiceCommand::Start(args),
        } => {
            run_service(args).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Resolve(args) => run_operation(OperationKind::Resolve, args).await,
        Command::Build(args) => run_operation(OperationKind::Build, args).await,
    }
}

async fn run_service(args: StartArgs) -> anyhow::Result<()> {
    if let Some(addr) = args.metrics_addr {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("failed to install the metrics exporter")?;
        info!(%addr, "metrics exporter listening");
    }

    let config = ServiceConfig {
        network: NetworkConfig {
            drain_timeout: Duration::from_secs(args.drain_timeout_secs),
            ..NetworkConfig::default()
        },
        stop_on_binary_change: args.stop_on_bin_mod,
        ..ServiceConfig::default()
    };
    let service = PackageService::new(config, Arc::new(PinningEngineFactory::default()));

    if args.socket_activation {
        let socket = SystemdActivation::from_env()?.acquire(&args.socket_name)?;
        let active = service.start_with_bound_socket(socket).await?;
        anyhow::ensure!(active, "service stopped before it became active");
        info!(name = %args.socket_name, "pkgsvc started on activated socket");
    } else {
        let endpoint = service.start(&args.service_url).await?;
        info!(%endpoint, "pkgsvc started");
    }

    tokio::select! {
        result = service.wait_for_close() => result?,
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for ctrl-c")?;
            info!("interrupt received");
            service.stop().await?;
        }
    }
    Ok(())
}

async fn run_operation(kind: OperationKind, args: OperationArgs) -> anyhow::Result<ExitCode> {
    let cwd = std::env::current_dir().context("cannot determine the current directory")?;
    let package_path = match args.package_path {
        Some(path) if path.is_absolute() => path,
        Some(path) => cwd.join(path),
        None => cwd,
    };
    let package_path = package_path
        .to_str()
        .with_context(|| format!("package path is not UTF-8: {}", package_path.display()))?;

    let client = ServiceClient::new(&args.service_url);
    let print = |line: &str| println!("{line}");
    let status = match kind {
        OperationKind::Resolve => client.resolve(package_path, print).await?,
        OperationKind::Build => client.build(package_path, print).await?,
    };

    if status.is_ok() {
        Ok(ExitCode::SUCCESS)
    } else {
        eprintln!("{status}");
        Ok(ExitCode::FAILURE)
    }
}
