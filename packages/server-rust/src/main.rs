//! `authrpc` entry point.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn, Dispatch};

use authrpc_server::broker::AmqpBroker;
use authrpc_server::logging::{bootstrap_dispatch, build_dispatch};
use authrpc_server::runner::{Runner, EXIT_CONFIG};
use authrpc_server::workflow::MemoryWorkflowFactory;

#[derive(Parser, Debug)]
#[command(name = "authrpc", version)]
#[command(about = "Serves session, user and group workflows over AMQP RPC")]
struct Args {
    /// Path to the JSON configuration document
    #[arg(short, long, env = "AUTHRPC_CONFIG", default_value = "./config.json")]
    config: PathBuf,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();
    let bootstrap = bootstrap_dispatch();

    let config = match authrpc_core::load_config(&args.config) {
        Ok(config) => config,
        Err(err) => {
            log_with(&bootstrap, || {
                error!(path = %args.config.display(), error = %err, "invalid configuration");
            });
            return exit_code(EXIT_CONFIG);
        }
    };

    let log = match build_dispatch(config.log.as_ref()) {
        Ok(log) => log,
        Err(err) => {
            log_with(&bootstrap, || {
                error!(error = %format!("{err:#}"), "cannot set up log_settings");
            });
            return exit_code(EXIT_CONFIG);
        }
    };

    log_with(&log, || {
        info!(
            version = env!("CARGO_PKG_VERSION"),
            config = %args.config.display(),
            "starting authrpc"
        );
    });

    let runner = Runner::new(
        config,
        Arc::new(AmqpBroker::new()),
        Arc::new(MemoryWorkflowFactory::new()),
        log.clone(),
    );

    match runner.run(shutdown_signal()).await {
        Ok(()) => {
            log_with(&log, || info!("authrpc shut down cleanly"));
            ExitCode::SUCCESS
        }
        Err(err) => {
            log_with(&log, || error!(error = %err, "authrpc stopped"));
            exit_code(err.exit_code())
        }
    }
}

fn log_with(dispatch: &Dispatch, f: impl FnOnce()) {
    tracing::dispatcher::with_default(dispatch, f);
}

fn exit_code(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "cannot listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received Ctrl+C"),
        () = terminate => info!("received SIGTERM"),
    }
    info!("shutting down");
}
