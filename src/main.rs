// src/main.rs

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use color_eyre::eyre::{Result, WrapErr};
use tokio::sync::mpsc;
use tracing::info;

use vanguard_engine::core::scanner::register_builtin;
use vanguard_engine::logging::initialize_logging;
use vanguard_engine::{Engine, EngineConfig, ScanEvent, ScanRequest};

#[derive(Parser)]
#[command(name = "vanguard-engine")]
#[command(about = "Runs a module-driven reconnaissance scan and prints what it finds as JSON")]
#[command(version)]
struct Cli {
    /// Host name, IP address, e-mail address or URL to scan.
    target: String,

    /// Config file to use instead of the one in the platform config directory.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Only run modules that help produce this event type. Repeatable.
    #[arg(short, long = "want")]
    wanted: Vec<String>,

    /// Never run this module. Repeatable.
    #[arg(short = 'x', long)]
    exclude: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    let config = EngineConfig::load(cli.config.as_deref()).wrap_err("loading configuration")?;
    let log_path = initialize_logging(&config.logging).wrap_err("initializing logging")?;
    info!(log = %log_path.display(), concurrency = config.max_concurrency, "Engine starting.");
    let engine = Engine::new(config);
    register_builtin(&engine)?;

    let mut request = ScanRequest::new(&cli.target);
    for event_type in cli.wanted {
        request = request.want(event_type);
    }
    for module_id in cli.exclude {
        request = request.exclude(module_id);
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<ScanEvent>();
    let handle = engine.start_scan(request, Arc::new(tx))?;
    info!(scan = %handle.id(), target = %cli.target, "Scan submitted.");

    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{line}"),
                Err(err) => eprintln!("failed to encode event: {err}"),
            }
        }
    });

    let status = tokio::select! {
        status = handle.wait() => status,
        _ = tokio::signal::ctrl_c() => {
            engine.abort_scan(handle.id())?;
            handle.wait().await
        }
    };

    // The sender lives in the scan context until the handle and the engine let go of it.
    engine.forget_scan(handle.id());
    drop(handle);
    printer.await?;

    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}
