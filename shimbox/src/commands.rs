//! Subcommand implementations

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use shimbox_host::{
    EnvironmentInjector, ExecutableDescriptor, FailureCause, FileKind, GuestProcessSupervisor,
    HostConfig, HostContextBuilder, ProcessState, SandboxSnapshot, SupervisorError, ValueType,
    VirtualValue,
};

const APP_NAME: &str = "shimbox";

/// Arguments of `shimbox run`
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub config: Option<PathBuf>,
    pub managed: bool,
    pub snapshot: Option<PathBuf>,
    pub journal: Option<PathBuf>,
    pub executable: PathBuf,
    pub args: Vec<String>,
}

/// Load the host config
///
/// An explicit path must exist. Without one, the per-user file is used when
/// present and the defaults otherwise.
pub fn load_config(explicit: Option<&Path>) -> anyhow::Result<HostConfig> {
    if let Some(path) = explicit {
        return Ok(HostConfig::from_file(path)?);
    }
    match HostConfig::default_path(APP_NAME) {
        Some(path) if path.exists() => {
            tracing::debug!(path = %path.display(), "Using per-user config");
            Ok(HostConfig::from_file(&path)?)
        }
        _ => Ok(HostConfig::default()),
    }
}

/// Process exit code for a terminal guest state
pub fn exit_code_for(state: &ProcessState) -> i32 {
    match state {
        ProcessState::Exited => 0,
        ProcessState::Failed(FailureCause::ExitCode(code)) => *code,
        // 128 + SIGINT, as a shell reports it
        ProcessState::Failed(FailureCause::TerminatedByHost) => 130,
        _ => 1,
    }
}

/// Supervise one guest until it ends; Ctrl-C terminates it
pub async fn run(options: RunOptions) -> anyhow::Result<i32> {
    let mut config = load_config(options.config.as_deref())?;
    if options.snapshot.is_some() {
        config.snapshot_path = options.snapshot;
    }
    if options.journal.is_some() {
        config.journal_path = options.journal;
    }

    let context = HostContextBuilder::new()
        .config(config)
        .build()
        .context("Failed to prepare the sandbox")?;

    let descriptor = if options.managed {
        ExecutableDescriptor::managed(&options.executable)
    } else {
        ExecutableDescriptor::native(&options.executable)
    }
    .args(options.args);

    let supervisor = GuestProcessSupervisor::new(descriptor, context, EnvironmentInjector::new())?;
    let pid = supervisor
        .launch()
        .await
        .with_context(|| format!("Failed to launch {}", options.executable.display()))?;
    tracing::info!(pid, "Guest running");

    let state = tokio::select! {
        state = supervisor.wait_for_exit() => state?,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!(pid, "Interrupted; terminating guest");
            interrupt(&supervisor).await?
        }
    };
    supervisor.close().await;

    match &state {
        ProcessState::Exited => tracing::info!(pid, "Guest exited"),
        ProcessState::Failed(cause) => tracing::warn!(pid, ?cause, "Guest failed"),
        _ => {}
    }
    Ok(exit_code_for(&state))
}

/// Terminate the guest; one that already ended keeps its own outcome
async fn interrupt(supervisor: &GuestProcessSupervisor) -> Result<ProcessState, SupervisorError> {
    match supervisor.terminate().await {
        Err(SupervisorError::NotRunning(_)) => supervisor.wait_for_exit().await,
        other => other,
    }
}

/// Print the contents of a snapshot file
pub fn render_snapshot(path: &Path, out: &mut impl Write) -> anyhow::Result<()> {
    let snapshot = SandboxSnapshot::load(path)
        .with_context(|| format!("Failed to read snapshot {}", path.display()))?;

    writeln!(
        out,
        "{} (version {}, {} keys, {} files)",
        path.display(),
        snapshot.version,
        snapshot.keys.len(),
        snapshot.files.len()
    )?;

    for key in &snapshot.keys {
        writeln!(out, "[{}] {}", key.handle, key.path)?;
        for value in key.values.values() {
            let name = if value.name.is_empty() {
                "(default)"
            } else {
                &value.name
            };
            writeln!(out, "    {} {:?} = {}", name, value.value_type, display_value(value))?;
        }
    }

    if !snapshot.files.is_empty() {
        writeln!(out, "files:")?;
        for entry in &snapshot.files {
            let kind = match entry.kind {
                FileKind::File => "file",
                FileKind::Directory => "dir",
            };
            writeln!(out, "    {} {} -> {}", kind, entry.path, entry.location)?;
        }
    }
    Ok(())
}

fn display_value(value: &VirtualValue) -> String {
    if let Some(text) = value.as_string() {
        return format!("{:?}", text);
    }
    if let Some(n) = value.as_dword() {
        return n.to_string();
    }
    if let Some(n) = value.as_qword() {
        return n.to_string();
    }
    match (&value.data, value.value_type) {
        (None, _) | (_, ValueType::None) => "-".to_string(),
        (Some(data), _) => data.iter().map(|b| format!("{:02x}", b)).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shimbox_host::{FileEntry, FileTable, RegistryStore};
    use tempfile::TempDir;

    #[test]
    fn test_exit_codes() {
        assert_eq!(exit_code_for(&ProcessState::Exited), 0);
        assert_eq!(
            exit_code_for(&ProcessState::Failed(FailureCause::ExitCode(7))),
            7
        );
        assert_eq!(
            exit_code_for(&ProcessState::Failed(FailureCause::TerminatedByHost)),
            130
        );
        assert_eq!(
            exit_code_for(&ProcessState::Failed(FailureCause::Launch("boom".into()))),
            1
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_interrupt_after_exit_keeps_outcome() {
        let supervisor = GuestProcessSupervisor::new(
            ExecutableDescriptor::native("/bin/sh").args(["-c", "exit 3"]),
            HostContextBuilder::new().build().unwrap(),
            EnvironmentInjector::new().quiet(),
        )
        .unwrap();
        supervisor.launch().await.unwrap();
        let finished = supervisor.wait_for_exit().await.unwrap();
        assert_eq!(finished, ProcessState::Failed(FailureCause::ExitCode(3)));

        let state = interrupt(&supervisor).await.unwrap();
        assert_eq!(state, finished);
        assert_eq!(exit_code_for(&state), 3);
        supervisor.close().await;
    }

    #[test]
    fn test_explicit_config_must_exist() {
        let dir = TempDir::new().unwrap();
        assert!(load_config(Some(&dir.path().join("missing.json"))).is_err());
    }

    #[test]
    fn test_explicit_config_is_read() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("host.json");
        std::fs::write(&path, r#"{ "lock_timeout_ms": 50 }"#).unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.lock_timeout_ms, 50);
        assert_eq!(config.bind_address, HostConfig::default().bind_address);
    }

    #[test]
    fn test_render_snapshot() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sandbox.json");

        let registry = RegistryStore::new();
        let files = FileTable::new();
        let (_, handle, _) = registry.create_key(r"HKLM\Software\Acme").unwrap();
        registry
            .set_value(handle, VirtualValue::string("Owner", "ops"))
            .unwrap();
        registry
            .set_value(handle, VirtualValue::dword("Build", 42))
            .unwrap();
        files
            .register(FileEntry::file(r"C:\acme\app.ini", "files/app.ini"))
            .unwrap();
        SandboxSnapshot::capture(&registry, &files)
            .save(&path)
            .unwrap();

        let mut out = Vec::new();
        render_snapshot(&path, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();

        assert!(text.contains("1 keys, 1 files"));
        assert!(text.contains(r"HKLM\Software\Acme"));
        assert!(text.contains(r#"Owner String = "ops""#));
        assert!(text.contains("Build DwordLe = 42"));
        assert!(text.contains(r"file C:\acme\app.ini -> files/app.ini"));
    }

    #[test]
    fn test_render_missing_snapshot_is_empty() {
        let dir = TempDir::new().unwrap();
        let mut out = Vec::new();
        render_snapshot(&dir.path().join("none.json"), &mut out).unwrap();
        assert!(String::from_utf8(out).unwrap().contains("0 keys, 0 files"));
    }
}
