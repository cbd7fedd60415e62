//! `mapbot-cli` – Mapbot bridge launcher
//!
//! This binary is the ignition switch for the robot bridge.  It:
//!
//! 1. Loads `~/.mapbot/config.toml` (writing defaults on first run) and
//!    applies `MAPBOT_*` overrides.
//! 2. Initialises structured logging.
//! 3. Opens the map database, builds the [`AppContext`], starts the pipeline
//!    and the device link, and serves the browser gateway.
//! 4. Intercepts **Ctrl-C** to close the device link (cancelling its timers)
//!    and exit cleanly.

mod config;

use std::sync::Arc;

use colored::Colorize;
use mapbot_cockpit::CockpitServer;
use mapbot_memory::SqliteMapStore;
use mapbot_middleware::WebSocketTransport;
use mapbot_runtime::{AppContext, LogFormat, TelemetryConfig, init_tracing};
use mapbot_types::MapError;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

fn main() {
    let cfg = load_config();

    // ── Structured logging ────────────────────────────────────────────────
    let mut telemetry = TelemetryConfig::from_env("mapbot");
    telemetry.log_format = LogFormat::parse(&cfg.log_format);
    let _guard = init_tracing(&telemetry);

    print_banner();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("{}: {}", "Failed to start async runtime".red(), e);
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run(cfg)) {
        error!(error = %e, "bridge stopped with error");
        eprintln!("{}: {}", "Fatal".red().bold(), e);
        std::process::exit(1);
    }
}

/// Config from disk, or defaults (saved for next time) on first run.
fn load_config() -> config::Config {
    match config::load() {
        Ok(Some(cfg)) => {
            println!(
                "  Config loaded from {}",
                config::config_path().display().to_string().bold()
            );
            cfg
        }
        Ok(None) => {
            let mut cfg = config::Config::default();
            match config::save(&cfg) {
                Ok(()) => println!(
                    "  {} Default config written to {}",
                    "✓".green().bold(),
                    config::config_path().display().to_string().bold()
                ),
                Err(e) => println!("{}: {}", "Error saving config".red(), e),
            }
            config::apply_env_overrides(&mut cfg);
            cfg
        }
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            let mut cfg = config::Config::default();
            config::apply_env_overrides(&mut cfg);
            cfg
        }
    }
}

async fn run(cfg: config::Config) -> Result<(), MapError> {
    let db_path = cfg.database_path();
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            MapError::Persistence(format!("cannot create {}: {e}", parent.display()))
        })?;
    }
    let store = SqliteMapStore::open(&db_path)?;
    info!(path = %db_path.display(), "map database opened");

    let transport = WebSocketTransport::new(&cfg.device_host, cfg.device_port);
    println!("  Robot   {}", transport.url().bold());
    println!(
        "  Gateway {}",
        format!("http://localhost:{}", cfg.gateway_port).bold()
    );
    println!();

    let ctx = AppContext::new(cfg.pipeline_config(), Arc::new(transport), Arc::new(store));
    let pipeline = ctx.spawn();
    ctx.link.connect().await;

    // ── Ctrl-C handler ────────────────────────────────────────────────────
    let (stop_tx, mut stop_rx) = mpsc::unbounded_channel::<()>();
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – shutting down …".yellow().bold());
        let _ = stop_tx.send(());
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; graceful shutdown on Ctrl-C will not be available");
    }

    let server = CockpitServer::new(ctx.clone()).with_port(cfg.gateway_port);
    let served = tokio::select! {
        result = server.run() => result,
        _ = stop_rx.recv() => Ok(()),
    };

    ctx.link.disconnect().await;
    pipeline.shutdown();
    println!("{}", "  ✓ Device link closed.".green());
    println!("{}", "  ✓ Exiting mapbot.".green());
    served
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"   __  ___          __        __ "#.bold().cyan());
    println!("{}", r#"  /  |/  /__ ____  / /  ___  / /_"#.bold().cyan());
    println!("{}", r#" / /|_/ / _ `/ _ \/ _ \/ _ \/ __/"#.bold().cyan());
    println!("{}", r#"/_/  /_/\_,_/ .__/_.__/\___/\__/ "#.bold().cyan());
    println!("{}", r#"           /_/                   "#.bold().cyan());
    println!();
    println!(
        "  {} {}",
        "mapbot".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Robot mapping bridge");
    println!();
}
