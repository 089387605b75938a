//! Portcullis API gateway.
//!
//! Loads a gateway configuration and serves it, or checks it without serving.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use portcullis_lib::config::{Catalog, GatewayConfig};
use portcullis_lib::gateway::Gateway;
use portcullis_lib::server;
use portcullis_lib::stage::StageRegistry;
use portcullis_telemetry::{log_startup, LogFormat, Telemetry, TelemetryConfig};
use tokio::net::TcpListener;

#[derive(Parser, Debug)]
#[command(name = "portcullis", about = "Portcullis API gateway", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the gateway server.
    Serve {
        /// Gateway configuration file (YAML or JSON).
        #[arg(short, long, env = "PORTCULLIS_CONFIG")]
        config: PathBuf,

        /// Listen address.
        #[arg(long, env = "PORTCULLIS_LISTEN", default_value = "0.0.0.0:8080")]
        listen: SocketAddr,

        /// Enable development mode (internal error details in responses).
        #[arg(long, env = "PORTCULLIS_DEV")]
        dev: bool,

        /// Log level.
        #[arg(long, env = "PORTCULLIS_LOG_LEVEL", default_value = "info")]
        log_level: String,

        /// Log format (json or pretty).
        #[arg(long, env = "PORTCULLIS_LOG_FORMAT", default_value = "json")]
        log_format: LogFormat,

        /// Token for the stage admin endpoints; overrides the config file.
        #[arg(long, env = "PORTCULLIS_ADMIN_TOKEN", hide_env_values = true)]
        admin_token: Option<String>,
    },

    /// Load a configuration and build its stage without serving.
    Check {
        /// Gateway configuration file (YAML or JSON).
        #[arg(short, long)]
        config: PathBuf,
    },
}

struct ServeOptions {
    config: PathBuf,
    listen: SocketAddr,
    dev: bool,
    log_level: String,
    log_format: LogFormat,
    admin_token: Option<String>,
}

async fn run_serve(options: ServeOptions) -> anyhow::Result<()> {
    let telemetry = Telemetry::init(
        TelemetryConfig::new()
            .with_log_level(options.log_level)
            .with_log_format(options.log_format),
    )?;

    let mut config = GatewayConfig::load(&options.config)?;
    config.dev_mode |= options.dev;
    if options.admin_token.is_some() {
        config.admin_token = options.admin_token;
    }

    let gateway = Arc::new(Gateway::from_config(&config, telemetry.metrics_clone())?);
    log_startup!(
        config = %options.config.display(),
        stage = %config.stage,
        routes = config.routes.len(),
        dev_mode = config.dev_mode,
        admin = config.admin_token.is_some(),
        "gateway starting"
    );

    let listener = TcpListener::bind(options.listen)
        .await
        .with_context(|| format!("failed to bind to {}", options.listen))?;

    server::serve(gateway, listener, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
    })
    .await?;
    Ok(())
}

fn run_check(path: &Path) -> anyhow::Result<()> {
    let config = GatewayConfig::load(path)?;
    let catalog = Catalog::build(&config, &reqwest::Client::new())?;
    let routes = catalog.build_routes(&config.routes)?;

    let registry = StageRegistry::new(config.stage.clone());
    let publication = registry.publish(routes)?;

    println!(
        "{}: stage '{}' builds with {} route(s)",
        path.display(),
        config.stage,
        publication.stage.routes().len()
    );
    for route in publication.stage.routes() {
        let authorizer = route
            .authorizer
            .as_ref()
            .map(|a| format!(" [{}]", a.name))
            .unwrap_or_default();
        println!(
            "  {:<7} {} -> {}{}",
            route.method,
            route.path,
            route.integration.kind().as_str(),
            authorizer
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Serve {
            config,
            listen,
            dev,
            log_level,
            log_format,
            admin_token,
        } => {
            run_serve(ServeOptions {
                config,
                listen,
                dev,
                log_level,
                log_format,
                admin_token,
            })
            .await
        }
        Commands::Check { config } => run_check(&config),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::from(1)
        }
    }
}
