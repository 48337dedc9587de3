//! sentinel_client - stream camera frames to a detection service.
//!
//! This binary:
//! 1. Loads configuration (SENTINEL_CONFIG file, SENTINEL_* env, CLI flags)
//! 2. Opens the configured camera and transport
//! 3. Runs the session driver until Ctrl-C or `quit`
//! 4. Accepts console commands on stdin: start, stop, reset, status, quit
//! 5. Logs every published session change

use anyhow::{Context, Result};
use clap::Parser;
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::time::Duration;

use sentinel_client::{
    build_transport, open_source, ClientConfig, ClientRuntime, Command, ConnectionState,
    HttpAdmin, SessionController, SessionSnapshot, StatisticsAdmin, TransportMode,
};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Stream camera frames to a safety-vest detection service"
)]
struct Args {
    /// Config file (JSON, or TOML with a .toml extension).
    #[arg(long, env = "SENTINEL_CONFIG")]
    config: Option<PathBuf>,

    /// WebSocket endpoint used by the stream transport.
    #[arg(long)]
    ws_url: Option<String>,

    /// HTTP API root used by the request transport and admin calls.
    #[arg(long)]
    api_url: Option<String>,

    /// Transport mode: 'stream' or 'request'.
    #[arg(long)]
    transport: Option<TransportMode>,

    /// Capture ticks per second.
    #[arg(long)]
    target_fps: Option<u32>,

    /// JPEG quality in (0, 1].
    #[arg(long)]
    jpeg_quality: Option<f32>,

    /// Camera device (/dev/videoN or stub://camera).
    #[arg(long)]
    device: Option<String>,

    #[arg(long)]
    width: Option<u32>,

    #[arg(long)]
    height: Option<u32>,

    /// Fixed backoff before reconnecting a lost stream.
    #[arg(long)]
    reconnect_delay_ms: Option<u64>,

    /// Give up after this many reconnect attempts (default: never).
    #[arg(long)]
    reconnect_max_attempts: Option<u32>,

    /// Start capturing immediately instead of waiting for `start`.
    #[arg(long)]
    autostart: bool,

    /// Do not read console commands from stdin.
    #[arg(long)]
    no_console: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    if let Some(path) = &args.config {
        std::env::set_var("SENTINEL_CONFIG", path);
    }
    let mut cfg = ClientConfig::load().context("load configuration")?;
    apply_args(&mut cfg, &args);
    cfg.validate().context("validate configuration")?;

    log::info!(
        "sentinel_client {} ({} transport, {} @ {} fps)",
        env!("CARGO_PKG_VERSION"),
        cfg.transport,
        cfg.capture.device,
        cfg.capture.target_fps
    );

    let admin = HttpAdmin::new(&cfg.api_url, cfg.request_timeout);
    match admin.banner() {
        Ok(banner) => log::info!(
            "service: {} (model loaded: {})",
            banner.message,
            banner.model_loaded
        ),
        Err(err) => log::warn!("service banner unavailable: {}", err),
    }

    let source = open_source(&cfg.capture.device)?;
    let transport = build_transport(&cfg);
    let mut controller = SessionController::new(cfg.session_config(), transport, source)?;
    let snapshots = controller.subscribe();
    std::thread::Builder::new()
        .name("sentinel-snapshots".to_string())
        .spawn(move || log_snapshots(snapshots))
        .context("spawn snapshot logger")?;

    let (tx, rx) = mpsc::channel();
    let ctrlc_tx = tx.clone();
    ctrlc::set_handler(move || {
        let _ = ctrlc_tx.send(Command::Shutdown);
    })
    .context("set Ctrl-C handler")?;

    if !args.no_console {
        let console_tx = tx.clone();
        std::thread::Builder::new()
            .name("sentinel-console".to_string())
            .spawn(move || read_console(console_tx))
            .context("spawn console reader")?;
        log::info!("commands: start | stop | reset | status | quit");
    }
    if args.autostart {
        let _ = tx.send(Command::Start);
    }
    drop(tx);

    let admin: Arc<dyn StatisticsAdmin + Send + Sync> = Arc::new(admin);
    let mut runtime = ClientRuntime::new(controller, admin, rx);
    runtime.run();
    Ok(())
}

fn apply_args(cfg: &mut ClientConfig, args: &Args) {
    if let Some(url) = &args.ws_url {
        cfg.ws_url = url.clone();
    }
    if let Some(url) = &args.api_url {
        cfg.api_url = url.clone();
    }
    if let Some(mode) = args.transport {
        cfg.transport = mode;
    }
    if let Some(fps) = args.target_fps {
        cfg.capture.target_fps = fps;
    }
    if let Some(quality) = args.jpeg_quality {
        cfg.capture.jpeg_quality = quality;
    }
    if let Some(device) = &args.device {
        cfg.capture.device = device.clone();
    }
    if let Some(width) = args.width {
        cfg.capture.width = width;
    }
    if let Some(height) = args.height {
        cfg.capture.height = height;
    }
    if let Some(delay) = args.reconnect_delay_ms {
        cfg.reconnect.delay = Duration::from_millis(delay);
    }
    if let Some(max) = args.reconnect_max_attempts {
        cfg.reconnect.max_attempts = Some(max);
    }
}

fn read_console(tx: Sender<Command>) {
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        let command = match line.trim().to_lowercase().as_str() {
            "" => continue,
            "start" => Command::Start,
            "stop" => Command::Stop,
            "reset" => Command::ResetStatistics,
            "status" => Command::QueryStatus,
            "quit" | "exit" => Command::Shutdown,
            other => {
                log::warn!("unknown command '{}'", other);
                continue;
            }
        };
        if tx.send(command).is_err() || command == Command::Shutdown {
            return;
        }
    }
    // stdin closed; keep running until Ctrl-C.
}

fn log_snapshots(snapshots: Receiver<SessionSnapshot>) {
    let mut last_state = None;
    let mut last_results = 0;
    let mut last_error: Option<String> = None;
    for snapshot in snapshots {
        if last_state != Some(snapshot.state) {
            log::info!("session {}", snapshot.state);
            last_state = Some(snapshot.state);
        }
        if snapshot.metrics.last_error != last_error {
            if let Some(err) = &snapshot.metrics.last_error {
                log::warn!("session error: {}", err);
            }
            last_error = snapshot.metrics.last_error.clone();
        }
        if let Some(status) = &snapshot.service {
            log::debug!("service status: {:?}", status);
        }
        let results = snapshot.metrics.results_received;
        if results != last_results && snapshot.state == ConnectionState::Streaming {
            last_results = results;
            if let Some(detection) = &snapshot.detection {
                log::info!(
                    "{:?} conf={:.2} now[vest={} no_vest={}] total[vest={} no_vest={}] {:.1} fps",
                    detection.verdict(),
                    detection.confidence,
                    snapshot.current_counts.compliant,
                    snapshot.current_counts.violation,
                    snapshot.cumulative_statistics.compliant,
                    snapshot.cumulative_statistics.violation,
                    snapshot.metrics.fps
                );
            }
        }
    }
}
