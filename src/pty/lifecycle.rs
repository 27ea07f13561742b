use std::thread::sleep;
use std::time::{Duration, Instant};

use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use tracing::{debug, error, info};

const POLL_INTERVAL: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, PartialEq)]
pub enum ExitStatus {
    Code(i32),
    Signal(i32),
    Running,
    Stopped(i32),
}

impl ExitStatus {
    pub fn success(&self) -> bool {
        matches!(self, ExitStatus::Code(0))
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            ExitStatus::Code(code) => Some(*code),
            _ => None,
        }
    }

    pub fn signal(&self) -> Option<i32> {
        match self {
            ExitStatus::Signal(sig) => Some(*sig),
            _ => None,
        }
    }

    fn is_final(&self) -> bool {
        matches!(self, ExitStatus::Code(_) | ExitStatus::Signal(_))
    }
}

/// Tracks one child process until it is reaped.
///
/// Once the child has been reaped its pid may be recycled by the kernel, so
/// the final status is cached and no further `waitpid` or `kill` is issued.
#[derive(Debug)]
pub struct ProcessManager {
    child_pid: Pid,
    reaped: Option<ExitStatus>,
}

impl ProcessManager {
    pub fn new(child_pid: Pid) -> Self {
        Self {
            child_pid,
            reaped: None,
        }
    }

    /// Check whether the child has exited (non-blocking).
    pub fn try_wait(&mut self) -> Result<ExitStatus, nix::Error> {
        if let Some(status) = &self.reaped {
            return Ok(status.clone());
        }
        let status = self.waitpid(Some(WaitPidFlag::WNOHANG))?;
        if status.is_final() {
            self.reaped = Some(status.clone());
        }
        Ok(status)
    }

    /// Block until the child exits.
    pub fn wait(&mut self) -> Result<ExitStatus, nix::Error> {
        loop {
            if let Some(status) = &self.reaped {
                return Ok(status.clone());
            }
            match self.waitpid(None) {
                Ok(status) if status.is_final() => self.reaped = Some(status),
                Ok(_) => continue,
                Err(nix::Error::EINTR) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Poll for exit until `timeout` elapses; `None` if still running.
    pub fn wait_timeout(&mut self, timeout: Duration) -> Result<Option<ExitStatus>, nix::Error> {
        let start = Instant::now();

        loop {
            match self.try_wait()? {
                status if status.is_final() => return Ok(Some(status)),
                _ if start.elapsed() >= timeout => return Ok(None),
                _ => sleep(POLL_INTERVAL),
            }
        }
    }

    /// Send a signal unless the child was already reaped. Returns whether
    /// the signal was delivered.
    pub fn signal(&self, sig: Signal) -> Result<bool, nix::Error> {
        if self.reaped.is_some() {
            debug!("Not signalling reaped child {}", self.child_pid);
            return Ok(false);
        }
        signal::kill(self.child_pid, sig)?;
        Ok(true)
    }

    pub fn is_running(&mut self) -> Result<bool, nix::Error> {
        Ok(!self.try_wait()?.is_final())
    }

    pub fn exit_status(&self) -> Option<&ExitStatus> {
        self.reaped.as_ref()
    }

    pub fn pid(&self) -> Pid {
        self.child_pid
    }

    fn waitpid(&self, flags: Option<WaitPidFlag>) -> Result<ExitStatus, nix::Error> {
        match waitpid(self.child_pid, flags) {
            Ok(WaitStatus::StillAlive) => Ok(ExitStatus::Running),
            Ok(WaitStatus::Exited(_, code)) => {
                info!("Child process {} exited with code {}", self.child_pid, code);
                Ok(ExitStatus::Code(code))
            }
            Ok(WaitStatus::Signaled(_, signal, _)) => {
                info!("Child process {} terminated by signal {}", self.child_pid, signal as i32);
                Ok(ExitStatus::Signal(signal as i32))
            }
            Ok(WaitStatus::Stopped(_, signal)) => {
                debug!("Child process {} stopped by signal {}", self.child_pid, signal as i32);
                Ok(ExitStatus::Stopped(signal as i32))
            }
            Ok(WaitStatus::Continued(_)) => {
                debug!("Child process {} continued", self.child_pid);
                Ok(ExitStatus::Running)
            }
            // Ptrace events only occur for traced children
            #[allow(unreachable_patterns)]
            Ok(_) => Ok(ExitStatus::Running),
            Err(nix::Error::ECHILD) => {
                // Child already reaped
                debug!("Child process {} already reaped", self.child_pid);
                Ok(ExitStatus::Code(0)) // Assume success if we can't get status
            }
            Err(e) => {
                error!("Error waiting for child {}: {}", self.child_pid, e);
                Err(e)
            }
        }
    }
}
