use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use nix::fcntl::{self, FcntlArg, FdFlag, OFlag};
use nix::pty::{self, PtyMaster};
use nix::sys::signal::Signal;
use nix::sys::stat::Mode;
use nix::unistd::{self, ForkResult, Pid};
use tracing::{debug, error, info, trace, warn};

use crate::error::{ResizeError, SpawnError};
use crate::pty::lifecycle::{ExitStatus, ProcessManager};
use crate::pty::spawn::{self, CommandSpec};
use crate::screen::TermSize;

pub const DEFAULT_READ_CHUNK: usize = 4096;

/// How long a child that hung up its terminal gets to finish exiting
/// before it is killed.
const EXIT_GRACE: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unstarted,
    Running,
    Terminated,
}

/// A child process attached to a pseudo-terminal.
///
/// The session is the sole owner of the master descriptor. Its lifecycle is
/// linear: `Unstarted -> Running -> Terminated`; a terminated session is
/// never restarted, a new one is constructed instead.
pub struct PtySession {
    state: SessionState,
    master: Option<PtyMaster>,
    process: Option<ProcessManager>,
    child_pid: Option<Pid>,
    size: TermSize,
    read_buf: Vec<u8>,
    outbound: Vec<u8>,
    exit_status: Option<ExitStatus>,
    program: String,
}

impl PtySession {
    pub fn new(size: TermSize) -> Self {
        Self {
            state: SessionState::Unstarted,
            master: None,
            process: None,
            child_pid: None,
            size,
            read_buf: vec![0u8; DEFAULT_READ_CHUNK],
            outbound: Vec::new(),
            exit_status: None,
            program: String::new(),
        }
    }

    /// Upper bound on the bytes returned by one `poll_read`.
    pub fn with_read_chunk(mut self, bytes: usize) -> Self {
        self.read_buf = vec![0u8; bytes.max(1)];
        self
    }

    /// Spawn `command` on a fresh pty pair. On failure the session is left
    /// exactly as it was.
    pub fn start(&mut self, command: &CommandSpec) -> Result<(), SpawnError> {
        if self.state != SessionState::Unstarted {
            return Err(SpawnError::AlreadyStarted);
        }

        let prepared = command.prepare(self.size)?;
        info!("Spawning {} in a {}x{} pty", prepared.display(), self.size.cols, self.size.rows);

        // Create PTY master/slave pair
        let master = pty::posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY)
            .map_err(SpawnError::PtyAllocation)?;
        pty::grantpt(&master).map_err(SpawnError::PtyAllocation)?;
        pty::unlockpt(&master).map_err(SpawnError::PtyAllocation)?;

        let slave_name = slave_name(&master).map_err(SpawnError::PtyAllocation)?;
        debug!("PTY slave created: {}", slave_name);

        let master_fd = master.as_raw_fd();
        set_cloexec(master_fd)?;
        set_nonblocking(master_fd)?;
        set_window_size(master_fd, self.size)?;

        let slave_fd = fcntl::open(
            slave_name.as_str(),
            OFlag::O_RDWR | OFlag::O_NOCTTY | OFlag::O_CLOEXEC,
            Mode::empty(),
        )
        .map_err(SpawnError::PtyAllocation)?;
        // SAFETY: open just returned this descriptor
        let slave = unsafe { OwnedFd::from_raw_fd(slave_fd) };

        let (status_reader, status_writer) = spawn::cloexec_pipe()?;

        // Fork the process
        match unsafe { unistd::fork() }.map_err(SpawnError::Fork)? {
            ForkResult::Child => unsafe {
                spawn::exec_child(
                    &prepared,
                    slave.as_raw_fd(),
                    master_fd,
                    status_writer.as_raw_fd(),
                )
            },
            ForkResult::Parent { child } => {
                drop(slave);
                drop(status_writer);

                let mut process = ProcessManager::new(child);
                let status = spawn::read_exec_status(status_reader);
                let failure = match status {
                    Ok(None) => None,
                    Ok(Some(errno)) => Some(SpawnError::Exec {
                        program: prepared.display().to_string(),
                        source: io::Error::from_raw_os_error(errno),
                    }),
                    Err(e) => {
                        if let Err(kill_err) = process.signal(Signal::SIGKILL) {
                            warn!("Failed to send SIGKILL to child {}: {}", child, kill_err);
                        }
                        Some(SpawnError::Io(e))
                    }
                };
                if let Some(err) = failure {
                    error!("Failed to start {}: {}", prepared.display(), err);
                    if let Err(e) = process.wait() {
                        warn!("Failed to reap child {}: {}", child, e);
                    }
                    return Err(err);
                }

                info!("Forked child process: {}", child);
                self.master = Some(master);
                self.process = Some(process);
                self.child_pid = Some(child);
                self.program = prepared.display().to_string();
                self.state = SessionState::Running;
                Ok(())
            }
        }
    }

    /// Resize the PTY. Invalid geometry is rejected and the previous size kept.
    pub fn resize(&mut self, rows: u16, cols: u16) -> Result<(), ResizeError> {
        let size = TermSize::new(rows, cols)?;
        if let Some(master) = &self.master {
            set_window_size(master.as_raw_fd(), size)?;
        }
        debug!("PTY resized to {}x{}", cols, rows);
        self.size = size;
        Ok(())
    }

    /// Forward input to the child. Input to a session that is not running is
    /// dropped.
    pub fn write(&mut self, data: &[u8]) -> io::Result<()> {
        if self.state != SessionState::Running {
            trace!("Dropping {} input bytes for {:?} session", data.len(), self.state);
            return Ok(());
        }

        self.outbound.extend_from_slice(data);
        self.flush_outbound()
    }

    /// Read whatever output is pending without blocking.
    ///
    /// Returns `Ok(None)` when nothing is available. End of file moves the
    /// session to `Terminated`; other read failures tear it down and are
    /// returned.
    pub fn poll_read(&mut self) -> io::Result<Option<Vec<u8>>> {
        if self.state != SessionState::Running {
            return Ok(None);
        }
        self.flush_outbound()?;

        let Some(master) = self.master.as_mut() else {
            return Ok(None);
        };
        match master.read(&mut self.read_buf) {
            Ok(0) => {
                info!("PTY reached end of file");
                self.shutdown(EXIT_GRACE);
                Ok(None)
            }
            Ok(n) => Ok(Some(self.read_buf[..n].to_vec())),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(None),
            Err(e) if is_hangup(&e) => {
                info!("PTY slave hung up");
                self.shutdown(EXIT_GRACE);
                Ok(None)
            }
            Err(e) => {
                error!("PTY read failed: {}", e);
                self.shutdown(Duration::ZERO);
                Err(e)
            }
        }
    }

    /// Stop the child and release the master descriptor. Safe to call any
    /// number of times; only the first call on a running session acts.
    pub fn terminate(&mut self) {
        self.shutdown(Duration::ZERO);
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == SessionState::Running
    }

    pub fn size(&self) -> TermSize {
        self.size
    }

    pub fn child_pid(&self) -> Option<Pid> {
        self.child_pid
    }

    /// Exit status of the child once it has been reaped.
    pub fn exit_status(&self) -> Option<&ExitStatus> {
        self.exit_status.as_ref()
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    fn flush_outbound(&mut self) -> io::Result<()> {
        let Some(master) = self.master.as_mut() else {
            self.outbound.clear();
            return Ok(());
        };

        while !self.outbound.is_empty() {
            match master.write(&self.outbound) {
                Ok(0) => {
                    let err = io::Error::new(io::ErrorKind::WriteZero, "pty accepted no input");
                    return Err(self.fail(err));
                }
                Ok(n) => {
                    self.outbound.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    trace!("PTY input full, {} bytes queued", self.outbound.len());
                    break;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if is_hangup(&e) => {
                    info!("PTY slave hung up while writing");
                    self.shutdown(EXIT_GRACE);
                    break;
                }
                Err(e) => return Err(self.fail(e)),
            }
        }
        Ok(())
    }

    fn fail(&mut self, err: io::Error) -> io::Error {
        error!("PTY write failed: {}", err);
        self.shutdown(Duration::ZERO);
        err
    }

    fn shutdown(&mut self, grace: Duration) {
        if let Some(mut process) = self.process.take() {
            let exited = match process.wait_timeout(grace) {
                Ok(status) => status,
                Err(e) => {
                    warn!("Failed to poll child {}: {}", process.pid(), e);
                    None
                }
            };

            self.exit_status = match exited {
                Some(status) => Some(status),
                None => {
                    debug!("Killing child process {}", process.pid());
                    if let Err(e) = process.signal(Signal::SIGKILL) {
                        warn!("Failed to send SIGKILL to child: {}", e);
                    }
                    match process.wait() {
                        Ok(status) => Some(status),
                        Err(e) => {
                            warn!("Failed to reap child {}: {}", process.pid(), e);
                            None
                        }
                    }
                }
            };
        }

        if self.master.take().is_some() {
            debug!("Closed PTY master");
        }
        self.outbound.clear();

        if self.state == SessionState::Running {
            self.state = SessionState::Terminated;
            info!("Session for {} terminated", self.program);
        }
    }
}

impl Drop for PtySession {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// Linux reports a closed slave side as EIO on the master.
fn is_hangup(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::EIO)
}

#[cfg(target_os = "linux")]
fn slave_name(master: &PtyMaster) -> nix::Result<String> {
    pty::ptsname_r(master)
}

#[cfg(not(target_os = "linux"))]
fn slave_name(master: &PtyMaster) -> nix::Result<String> {
    // ptsname uses a static buffer; sessions are spawned by a single owner
    unsafe { pty::ptsname(master) }
}

fn set_cloexec(fd: RawFd) -> io::Result<()> {
    fcntl::fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
    Ok(())
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = OFlag::from_bits_truncate(fcntl::fcntl(fd, FcntlArg::F_GETFL)?);
    fcntl::fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(())
}

fn set_window_size(fd: RawFd, size: TermSize) -> io::Result<()> {
    let winsize = libc::winsize {
        ws_row: size.rows,
        ws_col: size.cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };

    if unsafe { libc::ioctl(fd, libc::TIOCSWINSZ as _, &winsize as *const _) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;
    use std::time::Instant;

    fn session(rows: u16, cols: u16) -> PtySession {
        PtySession::new(TermSize::new(rows, cols).unwrap())
    }

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new(["/bin/sh", "-c", script])
    }

    /// Collect output until `needle` shows up, the session ends or time runs out.
    fn read_until(pty: &mut PtySession, needle: &str, timeout: Duration) -> String {
        let deadline = Instant::now() + timeout;
        let mut output = Vec::new();
        while Instant::now() < deadline {
            match pty.poll_read().unwrap() {
                Some(bytes) => output.extend_from_slice(&bytes),
                None if !pty.is_running() => break,
                None => sleep(Duration::from_millis(10)),
            }
            if String::from_utf8_lossy(&output).contains(needle) {
                break;
            }
        }
        String::from_utf8_lossy(&output).into_owned()
    }

    fn read_to_end(pty: &mut PtySession) -> String {
        read_until(pty, "\u{0}never", Duration::from_secs(5))
    }

    #[test]
    fn test_pty_spawn_and_eof() {
        let mut pty = session(24, 80);
        assert_eq!(pty.state(), SessionState::Unstarted);
        pty.start(&sh("printf hello")).unwrap();
        assert_eq!(pty.state(), SessionState::Running);
        assert!(pty.child_pid().is_some());

        let output = read_to_end(&mut pty);
        assert!(output.contains("hello"), "output: {:?}", output);
        assert_eq!(pty.state(), SessionState::Terminated);
        assert_eq!(pty.exit_status(), Some(&ExitStatus::Code(0)));
    }

    #[test]
    fn test_child_sees_terminal_environment() {
        let mut pty = session(24, 80);
        pty.start(&sh("printf '%s %s %s' \"$TERM\" \"$COLUMNS\" \"$LINES\"; stty size"))
            .unwrap();
        let output = read_to_end(&mut pty);
        assert!(output.contains("xterm-256color 80 24"), "output: {:?}", output);
        assert!(output.contains("24 80"), "output: {:?}", output);
    }

    #[test]
    fn test_working_directory() {
        let mut pty = session(24, 80);
        pty.start(&sh("pwd").working_dir("/")).unwrap();
        let output = read_to_end(&mut pty);
        assert!(output.starts_with("/\r\n"), "output: {:?}", output);
    }

    #[test]
    fn test_write_reaches_child() {
        let mut pty = session(24, 80);
        pty.start(&sh("read line; printf 'got:%s' \"$line\"")).unwrap();
        pty.write(b"abc\n").unwrap();
        let output = read_until(&mut pty, "got:abc", Duration::from_secs(5));
        assert!(output.contains("got:abc"), "output: {:?}", output);
    }

    #[test]
    fn test_resize_reaches_child() {
        let mut pty = session(24, 80);
        pty.start(&sh("read go; stty size")).unwrap();
        pty.resize(30, 100).unwrap();
        assert_eq!(pty.size(), TermSize::new(30, 100).unwrap());
        pty.write(b"\n").unwrap();
        let output = read_until(&mut pty, "30 100", Duration::from_secs(5));
        assert!(output.contains("30 100"), "output: {:?}", output);
    }

    #[test]
    fn test_resize_rejects_zero_geometry() {
        let mut pty = session(24, 80);
        assert!(matches!(
            pty.resize(0, 80),
            Err(ResizeError::InvalidGeometry { rows: 0, cols: 80 })
        ));
        assert!(pty.resize(24, 0).is_err());
        assert!(matches!(
            pty.resize(u16::MAX, u16::MAX),
            Err(ResizeError::InvalidGeometry { .. })
        ));
        assert_eq!(pty.size(), TermSize::new(24, 80).unwrap());
    }

    #[test]
    fn test_exec_failure_leaves_session_unstarted() {
        let mut pty = session(24, 80);
        let err = pty.start(&CommandSpec::new(["/nonexistent/kiosk-program"])).unwrap_err();
        match err {
            SpawnError::Exec { source, .. } => {
                assert_eq!(source.kind(), io::ErrorKind::NotFound);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(pty.state(), SessionState::Unstarted);
        assert!(pty.child_pid().is_none());

        let err = pty.start(&CommandSpec::new(["no-such-kiosk-program"])).unwrap_err();
        assert!(matches!(err, SpawnError::ProgramNotFound(_)));

        let err = pty.start(&sh("true").working_dir("/nonexistent-dir")).unwrap_err();
        assert!(matches!(err, SpawnError::Exec { .. }));
        assert_eq!(pty.state(), SessionState::Unstarted);
    }

    #[test]
    fn test_start_only_once() {
        let mut pty = session(24, 80);
        pty.start(&sh("sleep 5")).unwrap();
        assert!(matches!(
            pty.start(&sh("true")),
            Err(SpawnError::AlreadyStarted)
        ));
        pty.terminate();
        assert!(matches!(
            pty.start(&sh("true")),
            Err(SpawnError::AlreadyStarted)
        ));
    }

    #[test]
    fn test_terminate_twice() {
        let mut pty = session(24, 80);
        pty.start(&CommandSpec::new(["sleep", "30"])).unwrap();

        pty.terminate();
        assert_eq!(pty.state(), SessionState::Terminated);
        assert_eq!(
            pty.exit_status(),
            Some(&ExitStatus::Signal(Signal::SIGKILL as i32))
        );

        pty.terminate();
        assert_eq!(pty.state(), SessionState::Terminated);
        assert_eq!(
            pty.exit_status(),
            Some(&ExitStatus::Signal(Signal::SIGKILL as i32))
        );
        assert!(pty.poll_read().unwrap().is_none());
        pty.write(b"ignored").unwrap();
    }

    #[test]
    fn test_unstarted_session_is_inert() {
        let mut pty = session(24, 80);
        assert!(pty.poll_read().unwrap().is_none());
        pty.write(b"dropped").unwrap();
        pty.terminate();
        assert_eq!(pty.state(), SessionState::Unstarted);
        assert!(pty.exit_status().is_none());
    }

    #[test]
    fn test_read_chunk_bounds_poll() {
        let mut pty = session(24, 80).with_read_chunk(8);
        pty.start(&sh("printf 0123456789abcdefghij; sleep 1")).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut total = 0;
        while total < 20 && Instant::now() < deadline {
            match pty.poll_read().unwrap() {
                Some(bytes) => {
                    assert!(bytes.len() <= 8);
                    total += bytes.len();
                }
                None => sleep(Duration::from_millis(10)),
            }
        }
        assert_eq!(total, 20);
    }
}
