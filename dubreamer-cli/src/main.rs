mod cli;
mod controller;
mod logging;
mod server;
#[cfg(test)]
mod testing;

use anyhow::Context;
use dubreamer_engine::ConfigLoader;
use dubreamer_engine::hls::HttpOrigin;
use std::process;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::cli::Args;
use crate::controller::ProcessController;
use crate::logging::init_logging;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let args = Args::parse_normalized(std::env::args_os());

    let logging = match init_logging(&args.log, args.debug) {
        Ok(logging) => logging,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            process::exit(1);
        }
    };

    if let Err(e) = run(args, logging.file.clone()).await {
        error!("Fatal: {:#}", e);
        eprintln!("Error: {:#}", e);
        drop(logging);
        process::exit(1);
    }
}

async fn run(args: Args, log_file: logging::ReopenableLogFile) -> anyhow::Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "Starting dubreamer");

    let loader = ConfigLoader::new(args.config.clone())
        .allow_default_credentials(args.allow_default_credentials);
    let loaded = loader
        .load()
        .with_context(|| format!("failed to load configuration '{}'", args.config))?;
    if loaded.config.uses_default_credentials() {
        warn!("Running with the default credentials; set [auth] before exposing the status endpoint");
    }

    let addr = format!("{}:{}", loaded.config.hostname, loaded.config.port);
    let origin = HttpOrigin::new().context("failed to build the HTTP client")?;

    let controller =
        ProcessController::start(loader, loaded, Arc::new(origin), args.debug, Some(log_file))
            .await
            .context("failed to start the supervisor")?;
    controller.dump_config();

    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind status endpoint on {addr}"))?;
    let shutdown = CancellationToken::new();
    let server = tokio::spawn(server::serve(
        listener,
        controller.supervisor().clone(),
        shutdown.clone(),
    ));

    let report = controller.run().await.context("failed to install signal handlers")?;
    shutdown.cancel();
    match server.await {
        Ok(Err(e)) => warn!(error = %e, "Status endpoint stopped with an error"),
        Err(e) => warn!(error = %e, "Status endpoint task failed"),
        Ok(Ok(())) => {}
    }

    info!(
        drained = report.drained.len(),
        forced = ?report.forced,
        "dubreamer stopped"
    );
    Ok(())
}
