// llama gateway server: supervises backend processes and serves the admin API
use std::convert::Infallible;
use std::sync::Arc;

use anyhow::Context;
use chrono::Local;
use clap::Parser;
use hyper::service::{make_service_fn, service_fn};
use hyper::Server;
use log::{error, info};
use log4rs::append::console::ConsoleAppender;
use log4rs::append::file::FileAppender;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;
use tokio::sync::watch;

use llama_gateway::web::backend::memory::SystemMemorySampler;
use llama_gateway::web::config::GatewayArgs;
use llama_gateway::web::lifecycle::{listen_for_shutdown, stopped, Gateway};
use llama_gateway::web::routes::{handle_request, AppState};

const LOG_PATTERN: &str = "{d(%Y-%m-%d %H:%M:%S)} - {l} - {m}{n}";

fn setup_logging(args: &GatewayArgs) -> anyhow::Result<()> {
    std::fs::create_dir_all(&args.log_dir)?;
    let timestamp = Local::now().format("%Y-%m-%d-%H_%M").to_string();
    let log_path = args.log_dir.join(format!("{timestamp}.log"));

    let file_appender = FileAppender::builder()
        .encoder(Box::new(PatternEncoder::new(LOG_PATTERN)))
        .build(log_path)?;
    let console_appender = ConsoleAppender::builder()
        .encoder(Box::new(PatternEncoder::new(LOG_PATTERN)))
        .build();

    let config = Config::builder()
        .appender(Appender::builder().build("file", Box::new(file_appender)))
        .appender(Appender::builder().build("console", Box::new(console_appender)))
        .build(
            Root::builder()
                .appender("file")
                .appender("console")
                .build(args.log_level_filter()),
        )?;

    log4rs::init_config(config)?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = GatewayArgs::parse();
    if let Err(e) = setup_logging(&args) {
        eprintln!("Failed to set up logging: {e}");
    }

    let watchdog_config = args.watchdog_config().context("invalid watchdog configuration")?;
    info!("[SERVER] Watchdog configuration: {watchdog_config:?}");

    // Listen before anything is spawned so an early signal still reaches teardown.
    let stop = listen_for_shutdown();
    let gateway = Gateway::start(
        watchdog_config,
        args.loader_options(),
        Arc::new(SystemMemorySampler::new()),
    );

    let result = if gateway.preload(args.preload(), stopped(stop.clone())).await {
        serve(&args, gateway.state(), stop).await
    } else {
        Ok(())
    };

    gateway.shutdown().await;
    result
}

async fn serve(args: &GatewayArgs, state: AppState, stop: watch::Receiver<bool>) -> anyhow::Result<()> {
    let make_svc = make_service_fn(move |_conn| {
        let state = state.clone();
        async move { Ok::<_, Infallible>(service_fn(move |req| handle_request(req, state.clone()))) }
    });

    let server = Server::try_bind(&args.address)
        .with_context(|| format!("failed to bind {}", args.address))?
        .serve(make_svc)
        .with_graceful_shutdown(stopped(stop));

    info!("[SERVER] llama gateway listening on http://{}", args.address);
    println!("llama gateway listening on http://{}", args.address);
    println!("Available endpoints:");
    println!("  GET  /health                  - Health check");
    println!("  GET  /api/backends            - List loaded backends");
    println!("  POST /api/backends/load       - Load a model");
    println!("  POST /api/backends/shutdown   - Stop a model's backend");
    println!("  GET  /api/backends/monitor    - Backend process resource usage");
    println!("  GET  /api/settings            - Watchdog settings");
    println!("  POST /api/settings            - Update watchdog settings");

    if let Err(e) = server.await {
        error!("[SERVER] Server error: {e}");
    }
    Ok(())
}
