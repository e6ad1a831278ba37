//! Supervisor lifecycle against scripted and real guests

use async_trait::async_trait;
use shimbox_guest::GuestCore;
use shimbox_api::LogLevel;
use shimbox_host::{
    ExecutableDescriptor, FailureCause, GuestProcess, GuestProcessSupervisor, HostConfig,
    HostContext, HostContextBuilder, Injector, LaunchError, LaunchRequest, ProcessState,
    SandboxSnapshot, SupervisorError, VirtualValue,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

/// Guest whose exit is driven by the test
struct ScriptedProcess {
    exit: oneshot::Receiver<i32>,
    exit_code: Option<i32>,
    killed: Arc<AtomicBool>,
}

#[async_trait]
impl GuestProcess for ScriptedProcess {
    fn id(&self) -> u32 {
        4242
    }

    async fn wait(&mut self) -> Result<i32, LaunchError> {
        if let Some(code) = self.exit_code {
            return Ok(code);
        }
        let code = (&mut self.exit).await.unwrap_or(-1);
        self.exit_code = Some(code);
        Ok(code)
    }

    async fn kill(&mut self) -> Result<(), LaunchError> {
        self.killed.store(true, Ordering::SeqCst);
        self.exit_code = Some(-9);
        Ok(())
    }
}

struct ScriptedInjector {
    exit: Mutex<Option<oneshot::Receiver<i32>>>,
    requests: Arc<Mutex<Vec<LaunchRequest>>>,
    killed: Arc<AtomicBool>,
}

struct Script {
    exit: oneshot::Sender<i32>,
    requests: Arc<Mutex<Vec<LaunchRequest>>>,
    killed: Arc<AtomicBool>,
}

impl Script {
    fn channel_name(&self) -> String {
        self.requests.lock().unwrap()[0].channel_name.clone()
    }
}

fn scripted() -> (ScriptedInjector, Script) {
    let (tx, rx) = oneshot::channel();
    let requests = Arc::new(Mutex::new(Vec::new()));
    let killed = Arc::new(AtomicBool::new(false));
    (
        ScriptedInjector {
            exit: Mutex::new(Some(rx)),
            requests: Arc::clone(&requests),
            killed: Arc::clone(&killed),
        },
        Script {
            exit: tx,
            requests,
            killed,
        },
    )
}

#[async_trait]
impl Injector for ScriptedInjector {
    async fn create_and_inject(
        &self,
        request: &LaunchRequest,
    ) -> Result<Box<dyn GuestProcess>, LaunchError> {
        self.requests.lock().unwrap().push(request.clone());
        let exit = self
            .exit
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| LaunchError::Injection("already launched".into()))?;
        Ok(Box::new(ScriptedProcess {
            exit,
            exit_code: None,
            killed: Arc::clone(&self.killed),
        }))
    }
}

async fn wait(supervisor: &GuestProcessSupervisor) -> ProcessState {
    tokio::time::timeout(Duration::from_secs(10), supervisor.wait_for_exit())
        .await
        .expect("guest did not reach a terminal state")
        .unwrap()
}

#[tokio::test]
async fn test_clean_exit() {
    let (injector, script) = scripted();
    let context = HostContextBuilder::new()
        .config(HostConfig {
            interception_library: Some(PathBuf::from("/opt/shimbox/hook.so")),
            ..HostConfig::default()
        })
        .build()
        .unwrap();
    let supervisor = GuestProcessSupervisor::new(
        ExecutableDescriptor::native("app").args(["--fast"]),
        context,
        injector,
    )
    .unwrap();

    let pid = supervisor.launch().await.unwrap();
    assert_eq!(pid, 4242);
    assert_eq!(supervisor.process_id(), Some(4242));
    assert_eq!(supervisor.state(), ProcessState::Running);

    {
        let requests = script.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].executable, PathBuf::from("app"));
        assert_eq!(requests[0].args, vec!["--fast".to_string()]);
        assert_eq!(
            requests[0].interception_library,
            Some(PathBuf::from("/opt/shimbox/hook.so"))
        );
        assert!(requests[0].channel_name.starts_with("127.0.0.1:"));
    }

    script.exit.send(0).unwrap();
    assert_eq!(wait(&supervisor).await, ProcessState::Exited);
    assert!(!script.killed.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_non_zero_exit_fails() {
    let (injector, script) = scripted();
    let supervisor = GuestProcessSupervisor::start(
        ExecutableDescriptor::native("app"),
        HostContext::in_memory(),
        injector,
    )
    .await
    .unwrap();

    let mut states = supervisor.subscribe();
    script.exit.send(3).unwrap();
    assert_eq!(
        wait(&supervisor).await,
        ProcessState::Failed(FailureCause::ExitCode(3))
    );
    assert!(states.has_changed().unwrap());
    assert!(states.borrow_and_update().is_terminal());
}

#[tokio::test]
async fn test_terminate() {
    let (injector, script) = scripted();
    let supervisor = GuestProcessSupervisor::start(
        ExecutableDescriptor::native("app"),
        HostContext::in_memory(),
        injector,
    )
    .await
    .unwrap();

    let state = supervisor.terminate().await.unwrap();
    assert_eq!(state, ProcessState::Failed(FailureCause::TerminatedByHost));
    assert!(script.killed.load(Ordering::SeqCst));

    assert!(matches!(
        supervisor.terminate().await,
        Err(SupervisorError::NotRunning(_))
    ));
}

#[tokio::test]
async fn test_critical_guest_log_terminates() {
    let (injector, script) = scripted();
    let supervisor = GuestProcessSupervisor::start(
        ExecutableDescriptor::native("app"),
        HostContext::in_memory(),
        injector,
    )
    .await
    .unwrap();

    let channel = script.channel_name();
    tokio::task::spawn_blocking(move || {
        let core = GuestCore::connect_as(&channel, 4242).unwrap();
        core.log(LogLevel::Critical, "unhandled exception in hook")
            .unwrap();
    })
    .await
    .unwrap();

    assert_eq!(
        wait(&supervisor).await,
        ProcessState::Failed(FailureCause::GuestFault(
            "unhandled exception in hook".into()
        ))
    );
    assert!(script.killed.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_snapshot_flushed_on_exit() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sandbox.json");

    let (injector, script) = scripted();
    let context = HostContextBuilder::new()
        .snapshot_path(&path)
        .build()
        .unwrap();
    let registry = Arc::clone(&context.registry);
    let supervisor = GuestProcessSupervisor::start(
        ExecutableDescriptor::native("app"),
        context,
        injector,
    )
    .await
    .unwrap();

    let (_, handle, _) = registry.create_key("Software\\App").unwrap();
    registry
        .set_value(handle, VirtualValue::string("Installed", "yes"))
        .unwrap();

    script.exit.send(0).unwrap();
    assert_eq!(wait(&supervisor).await, ProcessState::Exited);

    let snapshot = SandboxSnapshot::load(&path).unwrap();
    assert_eq!(snapshot.keys.len(), 1);
    assert_eq!(snapshot.keys[0].path, "Software\\App");
    assert!(snapshot.keys[0].values.contains_key("Installed"));
}

#[tokio::test]
async fn test_launch_twice_refused() {
    let (injector, _script) = scripted();
    let supervisor = GuestProcessSupervisor::new(
        ExecutableDescriptor::native("app"),
        HostContext::in_memory(),
        injector,
    )
    .unwrap();

    supervisor.launch().await.unwrap();
    assert!(matches!(
        supervisor.launch().await,
        Err(SupervisorError::AlreadyStarted)
    ));
    supervisor.terminate().await.unwrap();
    supervisor.close().await;
}

#[cfg(unix)]
#[tokio::test]
async fn test_real_process_sees_channel() {
    use shimbox_host::EnvironmentInjector;

    let supervisor = GuestProcessSupervisor::start(
        ExecutableDescriptor::native("/bin/sh")
            .args(["-c", "test -n \"$SHIMBOX_CHANNEL\""]),
        HostContext::in_memory(),
        EnvironmentInjector::new().quiet(),
    )
    .await
    .unwrap();
    assert_eq!(wait(&supervisor).await, ProcessState::Exited);

    let failing = GuestProcessSupervisor::start(
        ExecutableDescriptor::native("/bin/sh").args(["-c", "exit 5"]),
        HostContext::in_memory(),
        EnvironmentInjector::new().quiet(),
    )
    .await
    .unwrap();
    assert_eq!(
        wait(&failing).await,
        ProcessState::Failed(FailureCause::ExitCode(5))
    );
}
