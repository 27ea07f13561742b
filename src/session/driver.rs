// Background driver: runs the session tick loop on a tokio task

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::input::Key;
use crate::screen::Grid;
use crate::session::{SessionStatus, TerminalSession};

/// Requests from the host to the session task.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionCommand {
    Write(Vec<u8>),
    Key(Key),
    Resize { rows: u16, cols: u16 },
    Terminate,
    Restart,
}

/// What the renderer draws. Published after every tick that changed it.
#[derive(Debug, Clone)]
pub struct Frame {
    pub grid: Arc<Grid>,
    pub status: SessionStatus,
    pub title: String,
    /// BEL received since the previous frame.
    pub bell: bool,
}

impl Frame {
    fn capture(session: &mut TerminalSession) -> Self {
        Self {
            grid: session.snapshot(),
            status: session.status(),
            title: session.title().to_string(),
            bell: session.take_bell(),
        }
    }

    fn same_as(&self, other: &Frame) -> bool {
        Arc::ptr_eq(&self.grid, &other.grid)
            && self.status == other.status
            && self.title == other.title
            && !other.bell
    }
}

/// Host side of a running driver. Dropping every handle stops the task and
/// the child with it.
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<SessionCommand>,
    frames: watch::Receiver<Frame>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    /// Queue a command. Returns false once the driver has stopped.
    pub fn send(&self, command: SessionCommand) -> bool {
        self.commands.send(command).is_ok()
    }

    pub fn write(&self, data: impl Into<Vec<u8>>) -> bool {
        self.send(SessionCommand::Write(data.into()))
    }

    pub fn send_key(&self, key: Key) -> bool {
        self.send(SessionCommand::Key(key))
    }

    pub fn resize(&self, rows: u16, cols: u16) -> bool {
        self.send(SessionCommand::Resize { rows, cols })
    }

    pub fn terminate(&self) -> bool {
        self.send(SessionCommand::Terminate)
    }

    pub fn restart(&self) -> bool {
        self.send(SessionCommand::Restart)
    }

    /// The most recently published frame.
    pub fn latest(&self) -> Frame {
        self.frames.borrow().clone()
    }

    /// A receiver that can be awaited for new frames.
    pub fn frames(&self) -> watch::Receiver<Frame> {
        self.frames.clone()
    }

    /// Stop the driver and wait for the child to be cleaned up.
    pub async fn shutdown(self) {
        let _ = self.commands.send(SessionCommand::Terminate);
        drop(self.commands);
        if let Err(e) = self.task.await {
            warn!("Session task ended abnormally: {}", e);
        }
    }
}

/// Move `session` onto a background task ticking at the configured rate.
pub fn spawn(mut session: TerminalSession) -> SessionHandle {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (frame_tx, frame_rx) = watch::channel(Frame::capture(&mut session));

    let task = tokio::spawn(run(session, command_rx, frame_tx));

    SessionHandle {
        commands: command_tx,
        frames: frame_rx,
        task,
    }
}

async fn run(
    mut session: TerminalSession,
    mut commands: mpsc::UnboundedReceiver<SessionCommand>,
    frames: watch::Sender<Frame>,
) {
    let mut ticker = time::interval(session.config().tick_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    info!("Session driver started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = session.tick() {
                    warn!("Session tick failed: {}", e);
                }
            }
            command = commands.recv() => {
                let Some(command) = command else {
                    debug!("All session handles dropped");
                    break;
                };
                apply(&mut session, command);
            }
        }

        let frame = Frame::capture(&mut session);
        frames.send_if_modified(|current| {
            if current.same_as(&frame) {
                false
            } else {
                *current = frame;
                true
            }
        });
    }

    session.terminate();
    info!("Session driver stopped");
}

fn apply(session: &mut TerminalSession, command: SessionCommand) {
    let result = match command {
        SessionCommand::Write(data) => session.write(&data),
        SessionCommand::Key(key) => session.send_key(key),
        SessionCommand::Resize { rows, cols } => {
            if let Err(e) = session.resize(rows, cols) {
                warn!("Ignoring resize to {}x{}: {}", cols, rows, e);
            }
            Ok(())
        }
        SessionCommand::Terminate => {
            session.terminate();
            Ok(())
        }
        SessionCommand::Restart => {
            if let Err(e) = session.restart() {
                warn!("Restart failed: {}", e);
            }
            Ok(())
        }
    };
    if let Err(e) = result {
        warn!("Session input failed: {}", e);
    }
}
