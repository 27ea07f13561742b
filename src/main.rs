//! kiosk-term - headless runner for the embedded terminal
//!
//! Runs the configured command on a pty, types stdin lines into it and
//! prints the final screen once the child exits, Ctrl-C arrives or the
//! duration elapses.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal::unix::{signal, SignalKind};
use tokio::time::sleep;
use tracing::{info, warn};

use kiosk_term::session::{driver, SessionStatus};
use kiosk_term::{TerminalConfig, TerminalSession};

#[derive(Parser)]
#[command(name = "kiosk-term", version, about = "Embedded terminal for the kiosk dashboard")]
struct Cli {
    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Config file (default: <config dir>/kiosk-term/terminal.json)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Terminal height in rows
    #[arg(short, long)]
    rows: Option<u16>,

    /// Terminal width in columns
    #[arg(long)]
    cols: Option<u16>,

    /// Command typed into the shell after it starts
    #[arg(short, long)]
    startup_command: Option<String>,

    /// Stop after this many seconds
    #[arg(long)]
    duration: Option<f64>,

    /// Program and arguments to run instead of the login shell
    #[arg(trailing_var_arg = true)]
    command: Vec<String>,
}

impl Cli {
    fn config(&self) -> Result<TerminalConfig> {
        let path = self.config.clone().or_else(TerminalConfig::default_path);
        let mut config = TerminalConfig::load_or_default(path.as_deref())
            .context("failed to load terminal config")?;

        if let Some(rows) = self.rows {
            config.rows = rows;
        }
        if let Some(cols) = self.cols {
            config.cols = cols;
        }
        if let Some(command) = &self.startup_command {
            config.startup_command = Some(command.clone());
        }
        if !self.command.is_empty() {
            config.command = self.command.clone();
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = cli.config()?;
    info!("Starting kiosk-term {} ({}x{})", env!("CARGO_PKG_VERSION"), config.cols, config.rows);

    let session = TerminalSession::start(config).context("failed to start terminal session")?;
    let handle = driver::spawn(session);
    let mut frames = handle.frames();

    let mut sigterm = signal(SignalKind::terminate()).context("failed to listen for SIGTERM")?;
    let duration = cli
        .duration
        .map(Duration::try_from_secs_f64)
        .transpose()
        .context("invalid --duration")?;
    let deadline = sleep(duration.unwrap_or(Duration::MAX));
    tokio::pin!(deadline);

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        if !frames.borrow_and_update().status.is_running() {
            break;
        }

        tokio::select! {
            changed = frames.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            line = stdin.next_line(), if stdin_open => match line {
                Ok(Some(line)) => {
                    handle.write(format!("{}\r", line));
                }
                Ok(None) => stdin_open = false,
                Err(e) => {
                    warn!("Failed to read stdin: {}", e);
                    stdin_open = false;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
                break;
            }
            _ = &mut deadline => {
                info!("Duration elapsed");
                break;
            }
        }
    }

    let frame = handle.latest();
    handle.shutdown().await;

    println!("{}", frame.grid.text());

    match frame.status {
        SessionStatus::Exited(Some(status)) => {
            info!("Child exited: {:?}", status);
            if let Some(code) = status.exit_code() {
                std::process::exit(code);
            }
        }
        SessionStatus::Failed(reason) => anyhow::bail!("terminal session failed: {}", reason),
        _ => {}
    }
    Ok(())
}
