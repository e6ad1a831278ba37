//! Process creation and injection seam
//!
//! Installing API hooks inside a target process is platform work that lives
//! outside this crate. The supervisor only needs something that starts the
//! guest with the interception layer attached and hands back a process it
//! can wait on or kill; that is the [`Injector`] trait.
//!
//! [`EnvironmentInjector`] is the portable implementation: it starts the
//! executable directly and tells the guest where the channel and the
//! interception library are through environment variables.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use shimbox_api::{CHANNEL_ENV_VAR, LIBRARY_ENV_VAR};
use thiserror::Error;
use tokio::process::{Child, Command};

/// Error type for launching guests
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("Failed to start {path}: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Not supported yet: {0}")]
    Unsupported(String),

    #[error("Injection failed: {0}")]
    Injection(String),

    #[error("Guest process I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything needed to start one guest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    pub executable: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// Name of the channel the guest connects back to
    pub channel_name: String,
    pub interception_library: Option<PathBuf>,
    /// Extra environment for the guest
    pub env: Vec<(String, String)>,
}

impl LaunchRequest {
    pub fn new(executable: impl Into<PathBuf>, channel_name: impl Into<String>) -> Self {
        Self {
            executable: executable.into(),
            args: Vec::new(),
            working_dir: None,
            channel_name: channel_name.into(),
            interception_library: None,
            env: Vec::new(),
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn interception_library(mut self, library: Option<PathBuf>) -> Self {
        self.interception_library = library;
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// A started guest
#[async_trait]
pub trait GuestProcess: Send {
    /// OS process identifier
    fn id(&self) -> u32;

    /// Wait for the guest to end and return its exit code
    async fn wait(&mut self) -> Result<i32, LaunchError>;

    /// Forcibly end the guest
    async fn kill(&mut self) -> Result<(), LaunchError>;
}

/// Creates a guest process with the interception layer attached
#[async_trait]
pub trait Injector: Send + Sync {
    async fn create_and_inject(
        &self,
        request: &LaunchRequest,
    ) -> Result<Box<dyn GuestProcess>, LaunchError>;

    /// Name used in logs
    fn name(&self) -> &str {
        "injector"
    }
}

/// Starts the guest directly, passing channel details in its environment
#[derive(Debug, Clone)]
pub struct EnvironmentInjector {
    inherit_stdio: bool,
}

impl EnvironmentInjector {
    pub fn new() -> Self {
        Self {
            inherit_stdio: true,
        }
    }

    /// Discard the guest's standard streams instead of sharing the host's
    pub fn quiet(mut self) -> Self {
        self.inherit_stdio = false;
        self
    }

    fn command(&self, request: &LaunchRequest) -> Command {
        let mut command = Command::new(&request.executable);
        command
            .args(&request.args)
            .env(CHANNEL_ENV_VAR, &request.channel_name)
            .kill_on_drop(true);
        if let Some(library) = &request.interception_library {
            command.env(LIBRARY_ENV_VAR, library);
        }
        for (key, value) in &request.env {
            command.env(key, value);
        }
        if let Some(dir) = &request.working_dir {
            command.current_dir(dir);
        }
        if !self.inherit_stdio {
            command
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null());
        }
        command
    }
}

impl Default for EnvironmentInjector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Injector for EnvironmentInjector {
    async fn create_and_inject(
        &self,
        request: &LaunchRequest,
    ) -> Result<Box<dyn GuestProcess>, LaunchError> {
        let child = self
            .command(request)
            .spawn()
            .map_err(|source| LaunchError::Spawn {
                path: request.executable.clone(),
                source,
            })?;
        let id = child.id().unwrap_or_default();
        tracing::debug!(pid = id, executable = %request.executable.display(), "Guest spawned");
        Ok(Box::new(ChildProcess { child, id }))
    }

    fn name(&self) -> &str {
        "environment"
    }
}

/// [`GuestProcess`] backed by a tokio child process
#[derive(Debug)]
pub struct ChildProcess {
    child: Child,
    id: u32,
}

#[async_trait]
impl GuestProcess for ChildProcess {
    fn id(&self) -> u32 {
        self.id
    }

    async fn wait(&mut self) -> Result<i32, LaunchError> {
        let status = self.child.wait().await?;
        // No code means the process was ended by a signal
        Ok(status.code().unwrap_or(-1))
    }

    async fn kill(&mut self) -> Result<(), LaunchError> {
        self.child.kill().await?;
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_environment_is_passed() {
        let request = LaunchRequest::new("/bin/sh", "127.0.0.1:4000")
            .args([
                "-c",
                "test \"$SHIMBOX_CHANNEL\" = 127.0.0.1:4000 && test \"$SHIMBOX_LIBRARY\" = /opt/hook.so",
            ])
            .interception_library(Some(PathBuf::from("/opt/hook.so")));

        let mut process = EnvironmentInjector::new()
            .quiet()
            .create_and_inject(&request)
            .await
            .unwrap();
        assert!(process.id() > 0);
        assert_eq!(process.wait().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_exit_code_reported() {
        let request = LaunchRequest::new("/bin/sh", "unused").args(["-c", "exit 3"]);
        let mut process = EnvironmentInjector::new()
            .quiet()
            .create_and_inject(&request)
            .await
            .unwrap();
        assert_eq!(process.wait().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_kill() {
        let request = LaunchRequest::new("/bin/sh", "unused").args(["-c", "sleep 30"]);
        let mut process = EnvironmentInjector::new()
            .quiet()
            .create_and_inject(&request)
            .await
            .unwrap();
        process.kill().await.unwrap();
        assert_eq!(process.wait().await.unwrap(), -1);
    }

    #[tokio::test]
    async fn test_missing_executable() {
        let request = LaunchRequest::new("/nonexistent/shimbox-guest", "unused");
        let result = EnvironmentInjector::new().create_and_inject(&request).await;
        assert!(matches!(result, Err(LaunchError::Spawn { .. })));
    }
}
