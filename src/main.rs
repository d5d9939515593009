// src/main.rs - smokectl entry point
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use smokectl::clock::SystemClock;
use smokectl::config::{self, Config};
use smokectl::console::{self, Console};
use smokectl::controller::{ControlContext, ControlSettings};
use smokectl::persistence::CsvSampleSink;
use smokectl::simulator::Simulation;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Parser)]
#[command(name = "smokectl", version, about = "PID temperature controller for a fan-driven smoker")]
struct Cli {
    /// Override the configured log level (error, warn, info, debug, trace)
    #[arg(long, global = true)]
    log_level: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control loop
    Run {
        #[arg(short, long, default_value = "smokectl.toml")]
        config: String,
        /// Initial setpoint in the display unit
        #[arg(long)]
        setpoint: Option<f64>,
        /// Drive a simulated smoker instead of hardware
        #[arg(long)]
        simulate: bool,
        /// Do not read operator commands from stdin
        #[arg(long)]
        no_console: bool,
    },
    /// Load and validate a configuration file
    CheckConfig {
        #[arg(short, long, default_value = "smokectl.toml")]
        config: String,
    },
}

fn init_logging(level: &str) -> Result<(), BoxError> {
    let level: tracing::Level = level
        .parse()
        .map_err(|_| format!("unknown log level '{}'", level))?;
    tracing_subscriber::fmt().with_max_level(level).init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let cli = Cli::parse();
    match cli.command {
        Command::CheckConfig { config: path } => {
            init_logging(cli.log_level.as_deref().unwrap_or("info"))?;
            let config = config::load_config(&path)?;
            tracing::info!(
                "Configuration OK: device '{}', {} probe(s), period {} ms",
                config.controller.device_name,
                config.probes.len(),
                config.control.sample_period_ms
            );
            Ok(())
        }
        Command::Run {
            config: config_path,
            setpoint,
            simulate,
            no_console,
        } => {
            // Logging level comes from the config, so read it before init.
            let mut config = match config::load_config(&config_path) {
                Ok(config) => config,
                Err(e) => {
                    init_logging("info")?;
                    tracing::error!("Failed to load config from '{}': {}", config_path, e);
                    return Err(e.into());
                }
            };
            init_logging(cli.log_level.as_deref().unwrap_or(&config.logging.level))?;
            if let Some(value) = setpoint {
                config.control.setpoint = config.controller.display_unit.to_celsius(value);
            }
            run(config, simulate, no_console).await
        }
    }
}

async fn run(config: Config, simulate: bool, no_console: bool) -> Result<(), BoxError> {
    tracing::info!("Starting smokectl");
    tracing::info!("Version: {}", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        "Device: {} (display unit {})",
        config.controller.device_name,
        config.controller.display_unit
    );

    if !simulate {
        tracing::error!("No hardware backend is built into this binary; run with --simulate");
        return Err("no hardware backend available".into());
    }
    let sim = Simulation::new(&config.simulation);

    let mut ctx = ControlContext::new(
        ControlSettings::from_config(&config),
        Box::new(sim.fan()),
        Arc::new(SystemClock),
    );

    let mut csv_writer = None;
    if let Some(path) = &config.persistence.csv_path {
        let (sink, handle) = CsvSampleSink::spawn(path, config.persistence.channel_capacity)?;
        let sink = Arc::new(sink);
        ctx = ctx.with_sink(sink.clone());
        csv_writer = Some((sink, handle));
    }
    let ctx = Arc::new(ctx);

    for probe in &config.probes {
        // The simulated sensor carries the inverse of its calibration offset.
        let driver = Arc::new(sim.probe(-probe.offset));
        let id = ctx.register_probe(probe, driver).await?;
        tracing::info!("Registered probe '{}' ({} at {})", id, probe.probe_type, probe.location);
    }
    if config.probes.is_empty() {
        tracing::warn!("No probes configured; fan will stay off");
    }

    let (shutdown_tx, _) = broadcast::channel::<()>(4);
    let control = ctx.spawn(shutdown_tx.subscribe());

    let console = if no_console {
        None
    } else {
        let input = console::spawn_stdin_reader(16)?;
        let console = Console::new(ctx.clone());
        Some(tokio::spawn(console.run(input, shutdown_tx.clone())))
    };

    let ctrl_c_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received");
            let _ = ctrl_c_tx.send(());
        }
    });

    let result = match control.await {
        Ok(result) => result.map_err(|e| Box::new(e) as BoxError),
        Err(e) => Err(Box::new(e) as BoxError),
    };
    let _ = shutdown_tx.send(());
    if let Some(console) = console {
        console.abort();
    }
    drop(ctx);

    if let Some((sink, handle)) = csv_writer {
        let dropped = sink.dropped();
        if dropped > 0 {
            tracing::warn!("CSV sink dropped {} samples in total", dropped);
        }
        drop(sink);
        match tokio::time::timeout(Duration::from_secs(2), handle).await {
            Ok(Ok(Ok(rows))) => tracing::info!("CSV sink closed after {} rows", rows),
            Ok(Ok(Err(e))) => tracing::error!("CSV sink failed: {}", e),
            Ok(Err(e)) => tracing::error!("CSV sink task panicked: {}", e),
            Err(_) => tracing::warn!("CSV sink did not drain in time"),
        }
    }

    match &result {
        Ok(()) => tracing::info!("smokectl stopped"),
        Err(e) => tracing::error!("smokectl stopped with error: {}", e),
    }
    result
}
