//! Child command description and the pre-fork/post-fork halves of spawning.
//!
//! Everything the child needs is allocated in the parent by
//! [`CommandSpec::prepare`]; after `fork` the child only makes
//! async-signal-safe calls until `execve`.

use std::collections::BTreeMap;
use std::env;
use std::ffi::{CString, OsStr, OsString};
use std::fs::File;
use std::io::{self, Read};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::{FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::ptr;

use nix::unistd;

use crate::error::SpawnError;
use crate::screen::TermSize;

const DEFAULT_TERM: &str = "xterm-256color";
const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// What to run inside the terminal.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandSpec {
    argv: Vec<String>,
    env: BTreeMap<String, String>,
    inherit_env: bool,
    working_dir: Option<PathBuf>,
    term: String,
}

impl CommandSpec {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            env: BTreeMap::new(),
            inherit_env: true,
            working_dir: None,
            term: DEFAULT_TERM.to_string(),
        }
    }

    /// The user's shell as a login shell.
    pub fn login_shell() -> Result<Self, SpawnError> {
        Ok(Self::new([detect_shell()?, "--login".to_string()]))
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Start from an empty environment instead of the parent's.
    pub fn clear_env(mut self) -> Self {
        self.inherit_env = false;
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn term(mut self, term: impl Into<String>) -> Self {
        self.term = term.into();
        self
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    pub fn program(&self) -> Option<&str> {
        self.argv.first().map(String::as_str)
    }

    /// Final child environment: inherited variables, then terminal type and
    /// geometry, then explicit overrides.
    pub fn environment(&self, size: TermSize) -> BTreeMap<OsString, OsString> {
        let mut vars: BTreeMap<OsString, OsString> = if self.inherit_env {
            env::vars_os().collect()
        } else {
            BTreeMap::new()
        };
        vars.insert("TERM".into(), self.term.clone().into());
        vars.insert("COLUMNS".into(), size.cols.to_string().into());
        vars.insert("LINES".into(), size.rows.to_string().into());
        for (key, value) in &self.env {
            vars.insert(key.into(), value.into());
        }
        vars
    }

    pub(crate) fn prepare(&self, size: TermSize) -> Result<PreparedCommand, SpawnError> {
        let program = self
            .program()
            .ok_or_else(|| SpawnError::InvalidArgument("empty command line".to_string()))?;

        let environment = self.environment(size);
        let path_var = environment.get(OsStr::new("PATH")).cloned();
        let resolved = resolve_program(program, path_var.as_deref())?;

        let argv = self
            .argv
            .iter()
            .map(|arg| c_string(arg.as_bytes().to_vec()))
            .collect::<Result<Vec<_>, _>>()?;
        let envp = environment
            .into_iter()
            .map(|(key, value)| {
                let mut entry = key.into_vec();
                entry.push(b'=');
                entry.extend_from_slice(value.as_bytes());
                c_string(entry)
            })
            .collect::<Result<Vec<_>, _>>()?;
        let working_dir = self
            .working_dir
            .as_ref()
            .map(|dir| c_string(dir.as_os_str().as_bytes().to_vec()))
            .transpose()?;

        Ok(PreparedCommand {
            program: c_string(resolved.into_os_string().into_vec())?,
            display: self.argv.join(" "),
            argv_ptrs: null_terminated(&argv),
            envp_ptrs: null_terminated(&envp),
            argv,
            envp,
            working_dir,
        })
    }
}

fn c_string(bytes: Vec<u8>) -> Result<CString, SpawnError> {
    CString::new(bytes).map_err(|e| SpawnError::InvalidArgument(e.to_string()))
}

fn null_terminated(strings: &[CString]) -> Vec<*const libc::c_char> {
    strings
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(ptr::null()))
        .collect()
}

/// Detect the user's preferred shell
pub fn detect_shell() -> Result<String, SpawnError> {
    // Try SHELL environment variable first
    if let Ok(shell) = env::var("SHELL") {
        if Path::new(&shell).exists() {
            return Ok(shell);
        }
    }

    // Try common shell locations
    let shells = ["/bin/bash", "/usr/bin/bash", "/bin/zsh", "/usr/bin/zsh", "/bin/sh"];

    shells
        .iter()
        .find(|shell| Path::new(shell).exists())
        .map(|shell| shell.to_string())
        .ok_or_else(|| SpawnError::ProgramNotFound("no suitable shell found".to_string()))
}

fn is_executable(path: &Path) -> bool {
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Locate `program` the way `execvp` would, using the child's `PATH`.
pub(crate) fn resolve_program(program: &str, path_var: Option<&OsStr>) -> Result<PathBuf, SpawnError> {
    if program.is_empty() {
        return Err(SpawnError::InvalidArgument("empty program name".to_string()));
    }
    // Explicit paths are handed to exec as-is so it reports the real errno
    if program.contains('/') {
        return Ok(PathBuf::from(program));
    }

    let search = path_var.unwrap_or_else(|| OsStr::new(DEFAULT_PATH));
    env::split_paths(search)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
        .ok_or_else(|| SpawnError::ProgramNotFound(program.to_string()))
}

/// A command ready to exec, with every allocation done up front.
pub(crate) struct PreparedCommand {
    program: CString,
    display: String,
    argv: Vec<CString>,
    envp: Vec<CString>,
    argv_ptrs: Vec<*const libc::c_char>,
    envp_ptrs: Vec<*const libc::c_char>,
    working_dir: Option<CString>,
}

impl PreparedCommand {
    pub(crate) fn display(&self) -> &str {
        &self.display
    }

    #[cfg(test)]
    pub(crate) fn arg_count(&self) -> usize {
        self.argv.len()
    }

    #[cfg(test)]
    pub(crate) fn env_count(&self) -> usize {
        self.envp.len()
    }
}

/// Create a pipe whose ends are both closed on exec.
pub(crate) fn cloexec_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as RawFd; 2];

    #[cfg(target_os = "linux")]
    let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };

    #[cfg(not(target_os = "linux"))]
    let rc = unsafe {
        let rc = libc::pipe(fds.as_mut_ptr());
        if rc == 0 {
            libc::fcntl(fds[0], libc::F_SETFD, libc::FD_CLOEXEC);
            libc::fcntl(fds[1], libc::F_SETFD, libc::FD_CLOEXEC);
        }
        rc
    };

    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: pipe just returned two fresh descriptors we exclusively own
    unsafe { Ok((OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1]))) }
}

/// Wait for the child to either exec (the status pipe closes empty) or
/// report the errno of the step that failed.
pub(crate) fn read_exec_status(reader: OwnedFd) -> io::Result<Option<i32>> {
    let mut file = File::from(reader);
    let mut buf = [0u8; 4];
    let mut filled = 0;

    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    match filled {
        0 => Ok(None),
        4 => Ok(Some(i32::from_ne_bytes(buf))),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "truncated exec status from child",
        )),
    }
}

fn last_errno() -> i32 {
    io::Error::last_os_error()
        .raw_os_error()
        .unwrap_or(libc::EINVAL)
}

unsafe fn report_and_exit(status_fd: RawFd, errno: i32) -> ! {
    let bytes = errno.to_ne_bytes();
    libc::write(status_fd, bytes.as_ptr().cast(), bytes.len());
    libc::_exit(127)
}

/// Child side of the fork: make the slave the controlling terminal and stdio,
/// then exec. Never returns; failures are written to `status_fd`.
///
/// # Safety
///
/// Must only be called in a freshly forked child. Only async-signal-safe
/// functions are used from here on.
pub(crate) unsafe fn exec_child(
    command: &PreparedCommand,
    slave_fd: RawFd,
    master_fd: RawFd,
    status_fd: RawFd,
) -> ! {
    let _ = unistd::close(master_fd);

    // New session, with the slave as its controlling terminal
    if let Err(e) = unistd::setsid() {
        report_and_exit(status_fd, e as i32);
    }
    if libc::ioctl(slave_fd, libc::TIOCSCTTY as _, 0) < 0 {
        report_and_exit(status_fd, last_errno());
    }

    // Redirect stdin, stdout, stderr to slave
    for fd in 0..=2 {
        if let Err(e) = unistd::dup2(slave_fd, fd) {
            report_and_exit(status_fd, e as i32);
        }
    }
    if slave_fd > 2 {
        let _ = unistd::close(slave_fd);
    }

    // Undo signal state inherited from the host process
    let mut mask: libc::sigset_t = std::mem::zeroed();
    libc::sigemptyset(&mut mask);
    libc::pthread_sigmask(libc::SIG_SETMASK, &mask, ptr::null_mut());
    libc::signal(libc::SIGPIPE, libc::SIG_DFL);

    if let Some(dir) = &command.working_dir {
        if libc::chdir(dir.as_ptr()) < 0 {
            report_and_exit(status_fd, last_errno());
        }
    }

    libc::execve(
        command.program.as_ptr(),
        command.argv_ptrs.as_ptr(),
        command.envp_ptrs.as_ptr(),
    );
    report_and_exit(status_fd, last_errno())
}
