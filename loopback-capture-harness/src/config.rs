use std::path::PathBuf;
use std::time::Duration;

/// How the capture child process is launched and stopped.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessTransportConfig {
    /// Capture executable; a bare name is looked up on `PATH`.
    pub executable: PathBuf,
    pub args: Vec<String>,
    /// Time between the graceful stop signal and the forced kill.
    pub grace_period: Duration,
    /// How often the exit watcher polls the child.
    pub poll_interval: Duration,
}

impl Default for ProcessTransportConfig {
    fn default() -> Self {
        Self {
            executable: PathBuf::from("loopback-capturer"),
            args: Vec::new(),
            grace_period: Duration::from_secs(3),
            poll_interval: Duration::from_millis(20),
        }
    }
}

impl ProcessTransportConfig {
    pub fn for_executable(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.executable.as_os_str().is_empty() {
            return Err("Executable path must not be empty".into());
        }
        if self.poll_interval.is_zero() {
            return Err("Poll interval must be greater than zero".into());
        }
        Ok(())
    }
}
