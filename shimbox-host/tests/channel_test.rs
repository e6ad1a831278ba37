//! Guest SDK against a live channel server

use shimbox_guest::{GuestCore, GuestError};
use shimbox_host::{
    ChannelServer, CreationDisposition, FileEntry, GuestEvent, HandleAllocator, HostContext,
    HostContextBuilder, MemoryChangeSink, NativeResultCode, RegistryStore, ValueType,
    VirtualValue,
};
use shimbox_api::{FailureKind, LogLevel};
use std::sync::Arc;
use std::time::Duration;

async fn blocking<T, F>(f: F) -> T
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.expect("guest task panicked")
}

#[tokio::test]
async fn test_registry_round_trip_over_channel() {
    let context = HostContext::in_memory();
    let registry = Arc::clone(&context.registry);
    let mut server = ChannelServer::bind(context).await.unwrap();
    let channel = server.channel_name();

    blocking(move || {
        let core = GuestCore::connect_as(&channel, 1234).unwrap();
        let registry = core.registry();

        let (code, created) = registry.create_key("Software\\App").unwrap();
        assert_eq!(code, NativeResultCode::Success);
        assert_eq!(created, Some((1, CreationDisposition::CreatedNew)));

        let (_, reopened) = registry.create_key("SOFTWARE\\app").unwrap();
        assert_eq!(reopened, Some((1, CreationDisposition::OpenedExisting)));

        let version = VirtualValue::string("Version", "1.0");
        assert_eq!(
            registry.set_value(1, version.clone()).unwrap(),
            NativeResultCode::Success
        );
        assert_eq!(
            registry.query_value(1, "Version").unwrap(),
            (NativeResultCode::Success, version)
        );

        let (code, missing) = registry.query_value(1, "Missing").unwrap();
        assert_eq!(code, NativeResultCode::FileNotFound);
        assert_eq!(missing.value_type, ValueType::Invalid);

        assert_eq!(registry.open_key("software\\app").unwrap(), Some(1));
        assert_eq!(
            registry.is_known_key(1).unwrap().as_deref(),
            Some("Software\\App")
        );

        assert_eq!(registry.delete_key(1).unwrap(), NativeResultCode::Success);
        let (code, _) = registry.query_value(1, "Version").unwrap();
        assert_eq!(code, NativeResultCode::InvalidHandle);
        assert_eq!(registry.is_known_key(1).unwrap(), None);
        assert!(core.is_connected());
    })
    .await;

    assert!(registry.is_empty());
    server.shutdown().await;
}

#[tokio::test]
async fn test_file_requests_over_channel() {
    let server = ChannelServer::bind(HostContext::in_memory()).await.unwrap();
    let channel = server.channel_name();

    blocking(move || {
        let core = GuestCore::connect(&channel).unwrap();
        let files = core.files();
        let entry = FileEntry::file("C:\\App\\settings.ini", "files/settings.ini");

        assert_eq!(files.register(entry.clone()).unwrap(), NativeResultCode::Success);
        assert_eq!(
            files.resolve("c:\\app\\SETTINGS.INI").unwrap(),
            (NativeResultCode::Success, Some(entry))
        );
        assert_eq!(
            files.remove("C:\\App\\settings.ini").unwrap(),
            NativeResultCode::Success
        );
        assert_eq!(
            files.resolve("C:\\App\\settings.ini").unwrap(),
            (NativeResultCode::FileNotFound, None)
        );
    })
    .await;
}

#[tokio::test]
async fn test_changes_are_journaled_with_process() {
    let journal = Arc::new(MemoryChangeSink::new());
    let context = HostContextBuilder::new().build().unwrap();
    let context = HostContext {
        journal: journal.clone(),
        ..context
    };
    let server = ChannelServer::bind(context).await.unwrap();
    let channel = server.channel_name();

    blocking(move || {
        let core = GuestCore::connect_as(&channel, 77).unwrap();
        let (_, created) = core.registry().create_key("K").unwrap();
        let (handle, _) = created.unwrap();
        core.registry()
            .set_value(handle, VirtualValue::dword("n", 1))
            .unwrap();
        core.registry().delete_key(handle).unwrap();
    })
    .await;

    let kinds: Vec<_> = journal
        .events()
        .iter()
        .map(|e| e.change.kind())
        .collect();
    assert_eq!(kinds, vec!["key_created", "value_set", "key_deleted"]);
    assert!(journal.events().iter().all(|e| e.process_id == Some(77)));
}

#[tokio::test]
async fn test_lock_timeout_reaches_guest_as_retryable() {
    let registry = Arc::new(RegistryStore::with_allocator(
        HandleAllocator::new(),
        Duration::from_millis(50),
    ));
    let context = HostContext {
        registry: Arc::clone(&registry),
        ..HostContext::in_memory()
    };
    let server = ChannelServer::bind(context).await.unwrap();
    let channel = server.channel_name();

    let view = registry.view();
    let error = blocking(move || {
        let core = GuestCore::connect(&channel).unwrap();
        core.registry().create_key("K").unwrap_err()
    })
    .await;
    drop(view);

    match error {
        GuestError::Host { kind, .. } => assert_eq!(kind, FailureKind::LockUnavailable),
        other => panic!("expected host failure, got {:?}", other),
    }
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_critical_log_is_reported() {
    let mut server = ChannelServer::bind(HostContext::in_memory()).await.unwrap();
    let mut events = server.take_events().unwrap();
    let channel = server.channel_name();

    blocking(move || {
        let core = GuestCore::connect_as(&channel, 9).unwrap();
        core.log(LogLevel::Warning, "slow disk").unwrap();
        core.log(LogLevel::Critical, "access violation").unwrap();
    })
    .await;

    assert_eq!(
        events.recv().await,
        Some(GuestEvent::Connected { process_id: 9 })
    );
    assert_eq!(
        events.recv().await,
        Some(GuestEvent::Critical {
            process_id: 9,
            message: "access violation".into()
        })
    );
}

#[tokio::test]
async fn test_shutdown_disconnects_guest() {
    let mut server = ChannelServer::bind(HostContext::in_memory()).await.unwrap();
    let channel = server.channel_name();

    let core = blocking(move || GuestCore::connect(&channel).unwrap()).await;
    server.shutdown().await;

    let connected = blocking(move || {
        // The connection task sees the shutdown and closes the socket
        std::thread::sleep(Duration::from_millis(100));
        core.is_connected()
    })
    .await;
    assert!(!connected);
}
