//! kiosk-term - the embedded terminal of the kiosk dashboard
//!
//! Runs a child program on a pseudo-terminal and keeps a virtual screen of
//! its output for a renderer to draw.
//!
//! ## Components
//!
//! - **PTY Session**: pty allocation, spawn, non-blocking I/O and teardown
//! - **Terminal Emulator**: resumable VT100/ANSI escape sequence parser
//! - **Screen Buffer**: character grid, cursor and scroll region
//! - **Session**: ties them together per frame tick, optionally on a tokio task

pub mod config;
pub mod error;
pub mod input;
pub mod pty;
pub mod screen;
pub mod session;

// Re-export commonly used types
pub use config::TerminalConfig;
pub use error::{KioskTermError, ResizeError, Result, SpawnError};
pub use input::Key;
pub use pty::{CommandSpec, ExitStatus, PtySession, SessionState};
pub use screen::{Cell, Cursor, Grid, Palette, TermSize, TerminalColor, TerminalEmulator};
pub use session::{SessionHandle, SessionStatus, TerminalSession};
