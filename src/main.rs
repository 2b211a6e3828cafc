use anyhow::Context;
use clap::Parser;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use botwarden::api::{create_router, AppState};
use botwarden::bootstrap::WardenContext;
use botwarden::cli::{Cli, Commands, ControlClient};
use botwarden::config::AppConfig;
use botwarden::coordination::shutdown::install_signal_handlers;
use botwarden::coordination::ShutdownPhase;
use botwarden::supervisor::{graph, SequenceOptions, StartSelection};

mod main_runtime;

use main_runtime::{init_logging, init_logging_simple, load_config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Serve {
            auto_start,
            safe_mode,
        } => {
            let config = load_config(cli.config.as_deref())?;
            init_logging(&config.logging);
            run_serve(config, *auto_start, *safe_mode).await?;
        }
        Commands::Validate => {
            init_logging_simple();
            let config = load_config(cli.config.as_deref())?;
            run_validate(&config)?;
        }
        Commands::Status { remote } => {
            init_logging_simple();
            let status = ControlClient::new(remote)?.status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Kill {
            reason,
            actor,
            remote,
        } => {
            init_logging_simple();
            let result = ControlClient::new(remote)?.kill(reason, actor).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::Override {
            reason,
            approved_by,
            actor,
            remote,
        } => {
            init_logging_simple();
            let result = ControlClient::new(remote)?
                .override_switch(reason, approved_by.as_deref(), actor)
                .await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
    }

    Ok(())
}

fn run_validate(config: &AppConfig) -> anyhow::Result<()> {
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("  - {}", e);
        }
        anyhow::bail!("configuration has {} problem(s)", errors.len());
    }

    let descriptors = config.descriptors();
    graph::validate(&descriptors)?;
    let all: HashSet<String> = descriptors.iter().map(|d| d.id.clone()).collect();

    println!("Configuration OK");
    println!("  workers:       {}", descriptors.len());
    println!("  start order:   {}", graph::start_order(&descriptors, &all).join(" -> "));
    println!("  triggers:      {}", config.kill_switch.triggers.len());
    println!("  checkpoints:   {}", config.recovery.checkpoint_dir.display());
    Ok(())
}

async fn run_serve(config: AppConfig, auto_start: bool, safe_mode: bool) -> anyhow::Result<()> {
    let bind_addr = config.api.bind_addr.clone();
    let ctx = Arc::new(
        WardenContext::build(config)
            .await
            .context("failed to initialize supervisor")?,
    );
    ctx.spawn_background().await;
    install_signal_handlers(ctx.shutdown.clone());

    let state = AppState::new(ctx.clone());
    if state.admin_fingerprint.is_none() {
        warn!("No admin token configured; control endpoints are unauthenticated");
    }

    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", bind_addr))?;
    info!("Control API listening on http://{}", bind_addr);

    let mut phase_rx = ctx.shutdown.phase_receiver();
    let router = create_router(state.clone());
    let server = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                // Keep serving reads until the shutdown sequence finishes
                let _ = phase_rx
                    .wait_for(|phase| *phase == ShutdownPhase::Complete)
                    .await;
            })
            .await
    });

    if auto_start {
        let supervisor = ctx.supervisor.clone();
        tokio::spawn(async move {
            let options = SequenceOptions {
                safe_mode,
                selection: StartSelection::AutoStart,
            };
            match supervisor.start_sequential(options).await {
                Ok(started) => info!("Auto-started {} worker(s): {:?}", started.len(), started),
                Err(e) => error!("Auto-start failed: {}", e),
            }
        });
    }

    let signal = ctx.shutdown.wait_for_request().await;
    info!("Shutting down ({})", signal);

    let intake = state.clone();
    if let Err(e) = ctx.shutdown(move || intake.stop_intake()).await {
        error!("Shutdown finished with errors: {}", e);
    }

    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Control API error: {}", e),
        Err(e) => error!("Control API task failed: {}", e),
    }
    info!("botwarden stopped");
    Ok(())
}
