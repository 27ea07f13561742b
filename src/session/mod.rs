//! The terminal pane as the host sees it: one pty session plus the emulator
//! that interprets its output, advanced a tick at a time.

pub mod driver;

use std::io;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info, warn};

use crate::config::TerminalConfig;
use crate::error::{ResizeError, Result};
use crate::input::Key;
use crate::pty::{ExitStatus, PtySession};
use crate::screen::{Cursor, Grid, TerminalEmulator};

pub use driver::{Frame, SessionCommand, SessionHandle};

#[derive(Debug, Clone, PartialEq)]
pub enum SessionStatus {
    Running,
    /// The child is gone. `None` if its status could not be collected.
    Exited(Option<ExitStatus>),
    /// Torn down after an I/O failure on the terminal.
    Failed(String),
}

impl SessionStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, SessionStatus::Running)
    }
}

struct PendingInput {
    due: Instant,
    text: String,
}

pub struct TerminalSession {
    config: TerminalConfig,
    pty: PtySession,
    emulator: TerminalEmulator,
    startup: Option<PendingInput>,
    failure: Option<String>,
}

impl TerminalSession {
    /// Spawn the configured command on a new pty.
    pub fn start(config: TerminalConfig) -> Result<Self> {
        config.validate()?;
        let size = config.size()?;
        let command = config.command_spec()?;

        let mut pty = PtySession::new(size).with_read_chunk(config.read_chunk_size);
        pty.start(&command)?;

        let startup = config.startup_command.clone().map(|text| PendingInput {
            due: Instant::now() + config.startup_delay(),
            text,
        });

        Ok(Self {
            emulator: TerminalEmulator::new(size),
            config,
            pty,
            startup,
            failure: None,
        })
    }

    /// Drain pending output into the screen. Returns the number of bytes
    /// applied. A read or write failure tears the session down and is
    /// returned once; later ticks do nothing.
    pub fn tick(&mut self) -> io::Result<usize> {
        let mut applied = 0;

        for _ in 0..self.config.max_reads_per_tick {
            let chunk = match self.pty.poll_read() {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(e) => return Err(self.fail(e)),
            };
            applied += chunk.len();
            self.emulator.feed(&chunk);

            let replies = self.emulator.take_replies();
            if !replies.is_empty() {
                if let Err(e) = self.pty.write(&replies) {
                    return Err(self.fail(e));
                }
            }
        }

        if let Err(e) = self.send_startup_command() {
            return Err(self.fail(e));
        }
        Ok(applied)
    }

    /// Forward raw input. Input to a finished session is dropped.
    pub fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.pty.write(data).map_err(|e| self.fail(e))
    }

    pub fn send_key(&mut self, key: Key) -> io::Result<()> {
        let bytes = key.encode(self.emulator.modes().application_cursor);
        self.write(&bytes)
    }

    /// Resize the pty and the screen together. Invalid geometry leaves both
    /// untouched.
    pub fn resize(&mut self, rows: u16, cols: u16) -> std::result::Result<(), ResizeError> {
        self.pty.resize(rows, cols)?;
        self.emulator.resize(self.pty.size());
        Ok(())
    }

    /// Read-only view of the screen for the renderer.
    pub fn snapshot(&mut self) -> Arc<Grid> {
        self.emulator.snapshot()
    }

    pub fn cursor(&self) -> Cursor {
        self.emulator.cursor()
    }

    pub fn title(&self) -> &str {
        self.emulator.title()
    }

    pub fn take_bell(&mut self) -> bool {
        self.emulator.take_bell()
    }

    pub fn status(&self) -> SessionStatus {
        if self.pty.is_running() {
            SessionStatus::Running
        } else if let Some(reason) = &self.failure {
            SessionStatus::Failed(reason.clone())
        } else {
            SessionStatus::Exited(self.pty.exit_status().cloned())
        }
    }

    pub fn config(&self) -> &TerminalConfig {
        &self.config
    }

    /// Stop the child. The last screen stays readable.
    pub fn terminate(&mut self) {
        self.pty.terminate();
    }

    /// Replace this session with a fresh one built from the same
    /// configuration. On failure the current session is kept.
    pub fn restart(&mut self) -> Result<()> {
        info!("Restarting terminal session");
        let fresh = Self::start(self.config.clone())?;
        *self = fresh;
        Ok(())
    }

    fn send_startup_command(&mut self) -> io::Result<()> {
        if !self.pty.is_running() {
            self.startup = None;
            return Ok(());
        }
        match &self.startup {
            Some(pending) if Instant::now() >= pending.due => {}
            _ => return Ok(()),
        }
        if let Some(pending) = self.startup.take() {
            debug!("Sending startup command: {}", pending.text);
            self.pty.write(pending.text.as_bytes())?;
            self.pty.write(b"\r")?;
        }
        Ok(())
    }

    fn fail(&mut self, err: io::Error) -> io::Error {
        error!("Terminal I/O failed: {}", err);
        if self.failure.is_none() {
            self.failure = Some(err.to_string());
        }
        if self.pty.is_running() {
            warn!("Tearing down session after I/O failure");
            self.pty.terminate();
        }
        err
    }
}
