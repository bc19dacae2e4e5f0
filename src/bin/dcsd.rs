//! DCS Daemon - device lock arbitration server
//!
//! This binary runs the coordination service: it loads the device catalog,
//! starts the lock registry and lease reaper, and serves the HTTP and
//! WebSocket API until interrupted.
//!
//! # Usage
//!
//! ```bash
//! # Start the daemon (foreground)
//! dcsd start --devices /etc/dcs/devices.toml
//!
//! # Start the daemon (background/daemonized)
//! dcsd --config /etc/dcs/dcsd.toml start -d
//!
//! # Stop the daemon serving the configured port
//! dcsd --config /etc/dcs/dcsd.toml stop
//!
//! # Check daemon status
//! dcsd --listen 127.0.0.1:60620 status
//! ```

use std::fs::{self, OpenOptions};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::{self, ExitCode};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use dcs_core::SystemClock;
use dcsd::catalog::{DeviceDirectory, FileCatalog};
use dcsd::config::DaemonConfig;
use dcsd::registry::{spawn_reaper, spawn_registry, RegistryConfig};
use dcsd::server::DaemonServer;

/// How long `stop` waits for the daemon to exit.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// DCS daemon - priority-based lock arbitration for shared devices
#[derive(Parser, Debug)]
#[command(name = "dcsd", version, about)]
struct Args {
    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Address to listen on (overrides the config file)
    #[arg(short, long, global = true)]
    listen: Option<SocketAddr>,

    /// Device catalog file (overrides the config file)
    #[arg(long, global = true)]
    devices: Option<PathBuf>,

    /// Directory for PID and log files (overrides the config file)
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the daemon
    Start {
        /// Detach from the terminal and log to the state directory
        #[arg(short = 'd', long)]
        daemon: bool,
    },
    /// Stop the daemon serving the configured port
    Stop,
    /// Show the daemon serving the configured port
    Status,
}

/// Runtime files of one daemon instance.
///
/// Names carry the listen port, so daemons bound to different ports can
/// share a state directory.
struct RuntimeFiles {
    dir: PathBuf,
    port: u16,
}

impl RuntimeFiles {
    fn for_config(config: &DaemonConfig) -> Self {
        let dir = config.state_dir.clone().unwrap_or_else(|| {
            dirs::state_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("dcs")
        });
        Self {
            dir,
            port: config.listen.port(),
        }
    }

    fn pid_path(&self) -> PathBuf {
        self.dir.join(format!("dcsd-{}.pid", self.port))
    }

    fn log_path(&self) -> PathBuf {
        self.dir.join(format!("dcsd-{}.log", self.port))
    }

    fn create_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create state directory {}", self.dir.display()))
    }
}

/// A claimed PID file. Dropping it removes the file.
struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// The live daemon recorded at `path`. A stale file is removed.
    fn live_pid(path: &Path) -> Option<u32> {
        let pid: u32 = fs::read_to_string(path).ok()?.trim().parse().ok()?;
        if process_alive(pid) {
            Some(pid)
        } else {
            let _ = fs::remove_file(path);
            None
        }
    }

    fn claim(path: PathBuf) -> Result<Self> {
        if let Some(pid) = Self::live_pid(&path) {
            bail!("dcsd is already running (PID {pid}); use 'dcsd stop' first");
        }
        fs::write(&path, format!("{}\n", process::id()))
            .with_context(|| format!("Failed to write PID file {}", path.display()))?;
        Ok(Self { path })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // Signal 0 checks for existence without delivering anything
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    false
}

#[cfg(unix)]
fn terminate(pid: u32) -> Result<()> {
    let raw = libc::pid_t::try_from(pid).context("PID out of range")?;
    if unsafe { libc::kill(raw, libc::SIGTERM) } != 0 {
        bail!(
            "Failed to send SIGTERM to process {pid}: {}",
            std::io::Error::last_os_error()
        );
    }
    Ok(())
}

#[cfg(not(unix))]
fn terminate(_pid: u32) -> Result<()> {
    bail!("Stop command is only supported on Unix systems")
}

/// Loads the config file and environment, then applies CLI overrides.
fn load_config(args: &Args) -> Result<DaemonConfig> {
    let mut config = DaemonConfig::load(args.config.as_deref()).with_context(|| match &args.config {
        Some(path) => format!("Failed to load config from {}", path.display()),
        None => "Failed to load configuration".to_string(),
    })?;

    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    if let Some(devices) = &args.devices {
        config.device_file = Some(devices.clone());
    }
    if let Some(state_dir) = &args.state_dir {
        config.state_dir = Some(state_dir.clone());
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

/// Loads the configured device catalog. Runs before detaching so a bad
/// catalog is reported on the terminal.
fn load_catalog(config: &DaemonConfig) -> Result<(PathBuf, DeviceDirectory)> {
    let Some(path) = config.device_file.clone() else {
        bail!("No device catalog configured; pass --devices or set device_file");
    };
    let directory = DeviceDirectory::load(Arc::new(FileCatalog::new(&path)))
        .with_context(|| format!("Failed to load device catalog from {}", path.display()))?;
    Ok((path, directory))
}

fn main() -> Result<ExitCode> {
    let args = Args::parse();
    let config = load_config(&args)?;
    let files = RuntimeFiles::for_config(&config);

    match args.command.unwrap_or(Command::Start { daemon: false }) {
        Command::Start { daemon } => start(config, &files, daemon),
        Command::Stop => stop(&files),
        Command::Status => Ok(status(&config, &files)),
    }
}

fn start(config: DaemonConfig, files: &RuntimeFiles, daemon: bool) -> Result<ExitCode> {
    if let Some(pid) = PidFile::live_pid(&files.pid_path()) {
        eprintln!("dcsd is already running on port {} (PID {pid})", files.port);
        eprintln!("Use 'dcsd stop' to stop it first.");
        return Ok(ExitCode::FAILURE);
    }

    let (catalog_path, directory) = load_catalog(&config)?;
    files.create_dir()?;
    if daemon {
        detach(&files.log_path())?;
    }

    // Claimed after detaching so the file records the daemon's own PID
    let _pid_file = PidFile::claim(files.pid_path())?;
    run_daemon(config, directory, &catalog_path)?;
    Ok(ExitCode::SUCCESS)
}

fn stop(files: &RuntimeFiles) -> Result<ExitCode> {
    let Some(pid) = PidFile::live_pid(&files.pid_path()) else {
        println!("dcsd is not running on port {}.", files.port);
        return Ok(ExitCode::SUCCESS);
    };

    println!("Stopping dcsd (PID {pid})...");
    terminate(pid)?;

    let deadline = Instant::now() + STOP_TIMEOUT;
    while Instant::now() < deadline {
        if !process_alive(pid) {
            println!("dcsd stopped.");
            return Ok(ExitCode::SUCCESS);
        }
        std::thread::sleep(Duration::from_millis(100));
    }

    eprintln!("dcsd did not stop within {} seconds.", STOP_TIMEOUT.as_secs());
    Ok(ExitCode::FAILURE)
}

fn status(config: &DaemonConfig, files: &RuntimeFiles) -> ExitCode {
    let Some(pid) = PidFile::live_pid(&files.pid_path()) else {
        println!("dcsd is not running on port {}.", files.port);
        return ExitCode::FAILURE;
    };

    let catalog = match load_catalog(config) {
        Ok((path, directory)) => format!("{} ({} devices)", path.display(), directory.snapshot().len()),
        Err(e) => format!("{e:#}"),
    };
    println!("dcsd is running (PID {pid})");
    println!("  api:     http://{}/api/v1", config.listen);
    println!("  catalog: {catalog}");
    println!("  log:     {}", files.log_path().display());
    ExitCode::SUCCESS
}

/// Detaches from the terminal, appending output to `log_path`.
fn detach(log_path: &Path) -> Result<()> {
    use daemonize::Daemonize;

    let log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .with_context(|| format!("Failed to open log file {}", log_path.display()))?;
    let log_err = log.try_clone().context("Failed to share log file with stderr")?;

    Daemonize::new()
        .working_directory("/")
        .umask(0o027)
        .stdout(log)
        .stderr(log_err)
        .start()
        .context("Failed to daemonize")
}

#[tokio::main]
async fn run_daemon(config: DaemonConfig, directory: DeviceDirectory, catalog_path: &Path) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("dcsd=info".parse()?)
                .add_directive("dcs_core=info".parse()?)
                .add_directive("dcs_protocol=info".parse()?),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        "DCS daemon starting"
    );

    let cancel_token = CancellationToken::new();

    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!(error = %e, "Error waiting for shutdown signal");
        }
        info!("Shutdown signal received");
        shutdown_token.cancel();
    });

    info!(
        devices = directory.snapshot().len(),
        catalog = %catalog_path.display(),
        "Device catalog loaded"
    );

    let registry_config = RegistryConfig::from_daemon(&config).context("Invalid lease settings")?;
    let registry = spawn_registry(registry_config, directory.clone(), Arc::new(SystemClock));
    info!("Lock registry started");

    let reaper_interval = config.reaper_interval();
    let _reaper_handle = spawn_reaper(registry.clone(), reaper_interval);
    info!(interval_ms = reaper_interval.as_millis() as u64, "Lease reaper started");

    let server = DaemonServer::new(registry.clone(), directory, config, cancel_token);

    let result = server.run().await;

    // Release every lock before exiting
    match registry.shutdown().await {
        Ok(count) => info!(sessions = count, "Disconnected remaining sessions"),
        Err(e) => warn!(error = %e, "Registry already stopped"),
    }

    if let Err(e) = result {
        error!(error = %e, "Server error");
        return Err(e.into());
    }

    info!("DCS daemon stopped");
    Ok(())
}

async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}
