// src/main.rs - CLI runner: load config, pick a sketch, drive the emulator
use clap::Parser;
use hostmock_mcu::fake::{Blink, Counter, VirtualPin};
use hostmock_rs::config::{self, Config, SketchKind};
use hostmock_rs::demo::{EchoSnapshot, UdpEcho};
use hostmock_rs::net::DatagramDispatcher;
use hostmock_rs::{Emulator, RunStats, Sketch};
use serde::Serialize;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Run firmware sketches on the host under an emulated cooperative scheduler.
#[derive(Parser, Debug)]
#[command(name = "hostmock", version, about)]
struct Cli {
    /// Path to a TOML config file (defaults apply without one)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Run setup and a single loop pass, then exit
    #[arg(long)]
    run_once: bool,

    /// Milliseconds the system context sleeps between ticks
    #[arg(long)]
    tick_ms: Option<u32>,

    /// Sketch to run: blink, counter or udp-echo
    #[arg(long)]
    sketch: Option<String>,

    /// UDP port for the udp-echo sketch
    #[arg(long)]
    udp_port: Option<u16>,

    /// Write the run summary as JSON to this file instead of stdout
    #[arg(long)]
    stats: Option<PathBuf>,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Cli {
    fn apply_overrides(&self, config: &mut Config) {
        if self.run_once {
            config.scheduler.run_once = true;
        }
        if let Some(tick_ms) = self.tick_ms {
            config.scheduler.tick_interval_ms = tick_ms;
        }
        if let Some(name) = &self.sketch {
            config.sketch.name = name.clone();
        }
        if let Some(port) = self.udp_port {
            config.sketch.udp_port = port;
        }
    }
}

#[derive(Debug, Serialize)]
struct Report {
    sketch: String,
    run: RunStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    led_toggles: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    counter_passes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    echo: Option<EchoSnapshot>,
}

/// Observers kept on the system side so the report can read them after the run.
enum Probe {
    Led(Arc<VirtualPin>),
    Passes(Arc<AtomicU64>),
    Echo(Arc<hostmock_rs::demo::EchoStats>),
}

fn build_sketch(
    config: &Config,
    dispatcher: &DatagramDispatcher,
) -> Result<(Box<dyn Sketch>, Probe), BoxError> {
    let kind = config
        .sketch_kind()
        .ok_or_else(|| format!("unknown sketch '{}'", config.sketch.name))?;
    Ok(match kind {
        SketchKind::Blink => {
            let led = VirtualPin::new();
            let sketch = Blink::new(led.clone(), config.sketch.blink_period_ms);
            (Box::new(sketch), Probe::Led(led))
        }
        SketchKind::Counter => {
            let passes = Arc::new(AtomicU64::new(0));
            let sketch = Counter::new(passes.clone(), 1);
            (Box::new(sketch), Probe::Passes(passes))
        }
        SketchKind::UdpEcho => {
            let bind = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.sketch.udp_port));
            let sketch = UdpEcho::new(&config.datagram, dispatcher, bind);
            let stats = sketch.stats();
            (Box::new(sketch), Probe::Echo(stats))
        }
    })
}

/// Raise `exit` on Ctrl-C from a helper thread running its own small runtime.
fn install_ctrl_c(exit: Arc<AtomicBool>) -> Result<(), BoxError> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    thread::Builder::new()
        .name("ctrl-c".to_string())
        .spawn(move || {
            runtime.block_on(async {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => {
                        tracing::info!("Ctrl-C received, stopping");
                        exit.store(true, Ordering::Release);
                    }
                    Err(e) => tracing::error!("Failed to listen for Ctrl-C: {}", e),
                }
            });
        })?;
    Ok(())
}

fn main() -> Result<(), BoxError> {
    let cli = Cli::parse();

    // Initialize logging
    let level = match cli.verbose {
        0 => tracing::Level::INFO,
        1 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let mut config = match &cli.config {
        Some(path) => {
            tracing::info!("Loading configuration from: {}", path.display());
            config::load_config(&path.to_string_lossy()).map_err(|e| {
                tracing::error!("Failed to load config from '{}': {}", path.display(), e);
                e
            })?
        }
        None => Config::default(),
    };
    cli.apply_overrides(&mut config);
    config.validate()?;

    let exit = Arc::new(AtomicBool::new(false));
    install_ctrl_c(exit.clone())?;

    let dispatcher = DatagramDispatcher::new();
    let (sketch, probe) = build_sketch(&config, &dispatcher)?;
    let sketch_name = sketch.name().to_string();

    let emulator = Emulator::from_config(&config.scheduler);
    let poll_dispatcher = dispatcher.clone();
    let run = emulator.run_loop(
        sketch,
        move || {
            poll_dispatcher.poll_incoming();
        },
        &exit,
    )?;

    let mut report = Report {
        sketch: sketch_name,
        run,
        led_toggles: None,
        counter_passes: None,
        echo: None,
    };
    match probe {
        Probe::Led(led) => report.led_toggles = Some(led.toggles()),
        Probe::Passes(passes) => report.counter_passes = Some(passes.load(Ordering::Acquire)),
        Probe::Echo(stats) => report.echo = Some(stats.snapshot()),
    }

    let json = serde_json::to_string_pretty(&report)?;
    match &cli.stats {
        Some(path) => {
            std::fs::write(path, json)?;
            tracing::info!("Run summary written to {}", path.display());
        }
        None => println!("{}", json),
    }
    Ok(())
}
