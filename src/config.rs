use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{KioskTermError, Result};
use crate::pty::CommandSpec;
use crate::screen::{Palette, TermSize};

const CONFIG_DIR: &str = "kiosk-term";
const CONFIG_FILE: &str = "terminal.json";

/// Settings for the embedded terminal pane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TerminalConfig {
    /// Program and arguments. Empty runs the user's shell as a login shell.
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub term: String,
    /// Defaults to the home directory.
    pub working_dir: Option<PathBuf>,
    pub rows: u16,
    pub cols: u16,
    /// Typed into the shell once it has had time to settle.
    pub startup_command: Option<String>,
    pub startup_delay_ms: u64,
    pub tick_rate_hz: u32,
    pub read_chunk_size: usize,
    pub max_reads_per_tick: usize,
    pub palette: Palette,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            env: BTreeMap::new(),
            term: "xterm-256color".to_string(),
            working_dir: None,
            rows: 24,
            cols: 95,
            startup_command: None,
            startup_delay_ms: 500,
            tick_rate_hz: 30,
            read_chunk_size: 4096,
            max_reads_per_tick: 16,
            palette: Palette::default(),
        }
    }
}

impl TerminalConfig {
    /// `<config_dir>/kiosk-term/terminal.json`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(CONFIG_DIR).join(CONFIG_FILE))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        info!("Loaded terminal config from {}", path.display());
        Ok(config)
    }

    /// Load `path` if it exists, otherwise fall back to defaults. A file that
    /// exists but does not parse is still an error.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) if path.exists() => Self::load(path),
            Some(path) => {
                debug!("No config at {}, using defaults", path.display());
                Ok(Self::default())
            }
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.rows == 0 || self.cols == 0 {
            return Err(KioskTermError::Configuration(format!(
                "terminal geometry must be non-zero, got {}x{}",
                self.cols, self.rows
            )));
        }
        if self.tick_rate_hz == 0 {
            return Err(KioskTermError::Configuration(
                "tick_rate_hz must be at least 1".to_string(),
            ));
        }
        if self.read_chunk_size == 0 || self.max_reads_per_tick == 0 {
            return Err(KioskTermError::Configuration(
                "read_chunk_size and max_reads_per_tick must be at least 1".to_string(),
            ));
        }
        if self.command.iter().any(|arg| arg.contains('\0')) {
            return Err(KioskTermError::Configuration(
                "command contains a NUL byte".to_string(),
            ));
        }
        Ok(())
    }

    pub fn size(&self) -> Result<TermSize> {
        Ok(TermSize::new(self.rows, self.cols)?)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(1) / self.tick_rate_hz.max(1)
    }

    pub fn startup_delay(&self) -> Duration {
        Duration::from_millis(self.startup_delay_ms)
    }

    /// Build the spawn description: the configured argv (or login shell),
    /// extra environment, terminal type and working directory.
    pub fn command_spec(&self) -> Result<CommandSpec> {
        let spec = if self.command.is_empty() {
            CommandSpec::login_shell()?
        } else {
            CommandSpec::new(&self.command)
        };

        let working_dir = self.working_dir.clone().or_else(dirs::home_dir);
        let mut spec = spec.envs(&self.env).term(&self.term);
        if let Some(dir) = working_dir {
            spec = spec.working_dir(dir);
        }
        Ok(spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::process;

    fn temp_file(name: &str, content: &str) -> PathBuf {
        let path = env::temp_dir().join(format!("kiosk-term-{}-{}", process::id(), name));
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_defaults() {
        let config = TerminalConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.size().unwrap(), TermSize::new(24, 95).unwrap());
        assert_eq!(config.tick_interval(), Duration::from_secs(1) / 30);
        assert_eq!(config.startup_delay(), Duration::from_millis(500));
        assert_eq!(config.term, "xterm-256color");
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: TerminalConfig =
            serde_json::from_str(r#"{"rows": 40, "command": ["/bin/sh"], "env": {"A": "1"}}"#)
                .unwrap();
        assert_eq!(config.rows, 40);
        assert_eq!(config.cols, 95);
        assert_eq!(config.command, vec!["/bin/sh".to_string()]);
        assert_eq!(config.env.get("A").map(String::as_str), Some("1"));
        assert_eq!(config.max_reads_per_tick, 16);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = TerminalConfig {
            cols: 0,
            ..TerminalConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(KioskTermError::Configuration(_))
        ));

        let config = TerminalConfig {
            tick_rate_hz: 0,
            ..TerminalConfig::default()
        };
        assert!(config.validate().is_err());

        let config = TerminalConfig {
            read_chunk_size: 0,
            ..TerminalConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let path = temp_file("load.json", r#"{"cols": 120, "startup_command": "ls"}"#);
        let config = TerminalConfig::load(&path).unwrap();
        assert_eq!(config.cols, 120);
        assert_eq!(config.startup_command.as_deref(), Some("ls"));
        fs::remove_file(&path).unwrap();

        let path = temp_file("invalid.json", r#"{"rows": 0}"#);
        assert!(matches!(
            TerminalConfig::load(&path),
            Err(KioskTermError::Configuration(_))
        ));
        fs::remove_file(&path).unwrap();

        let path = temp_file("broken.json", "{ not json");
        assert!(matches!(
            TerminalConfig::load_or_default(Some(&path)),
            Err(KioskTermError::Json(_))
        ));
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let path = env::temp_dir().join("kiosk-term-does-not-exist.json");
        let config = TerminalConfig::load_or_default(Some(&path)).unwrap();
        assert_eq!(config, TerminalConfig::default());
    }

    #[test]
    fn test_command_spec() {
        let config = TerminalConfig {
            command: vec!["/bin/echo".to_string(), "hi".to_string()],
            working_dir: Some(PathBuf::from("/tmp")),
            ..TerminalConfig::default()
        };
        let spec = config.command_spec().unwrap();
        assert_eq!(spec.argv(), ["/bin/echo".to_string(), "hi".to_string()]);
        assert_eq!(spec.program(), Some("/bin/echo"));
    }
}
