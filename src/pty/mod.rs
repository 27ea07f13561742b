pub mod host;
pub mod lifecycle;
pub mod spawn;

pub use host::{PtySession, SessionState};
pub use lifecycle::{ExitStatus, ProcessManager};
pub use spawn::{detect_shell, CommandSpec};
