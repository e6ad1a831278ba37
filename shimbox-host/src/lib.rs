//! shimbox-host: Supervising side of the shimbox sandbox
//!
//! This crate owns the virtual resource stores and everything that feeds
//! them: the handle allocator, the registry store and file table, the
//! channel a guest talks to, the request synchronizer, snapshot persistence,
//! the change journal and the guest process supervisor.

pub mod channel;
pub mod config;
pub mod files;
pub mod handle;
pub mod journal;
pub mod launcher;
pub mod registry;
pub mod snapshot;
pub mod supervisor;
pub mod synchronizer;

pub use channel::{ChannelError, ChannelServer, GuestEvent};
pub use config::{ConfigError, HostConfig, HostContext, HostContextBuilder};
pub use files::FileTable;
pub use handle::{HandleAllocator, HandleError, HandleUser};
pub use journal::{
    Change, ChangeEvent, ChangeSink, CompositeChangeSink, FileChangeSink, JournalError,
    MemoryChangeSink, NullChangeSink,
};
pub use launcher::{
    ChildProcess, EnvironmentInjector, GuestProcess, Injector, LaunchError, LaunchRequest,
};
pub use registry::{
    RegistryStore, RegistryView, StoreError, StoreResult, VirtualKey, WriteMode,
    DEFAULT_LOCK_TIMEOUT,
};
pub use shimbox_api::{
    CreationDisposition, FileEntry, FileKind, KeyHandle, NativeResultCode, ValueType,
    VirtualValue,
};
pub use snapshot::{SandboxSnapshot, SnapshotError, SNAPSHOT_VERSION};
pub use supervisor::{
    ExecutableDescriptor, ExecutableKind, FailureCause, GuestProcessSupervisor, ProcessState,
    SupervisorError,
};
pub use synchronizer::{
    FileSynchronizer, RegistrySynchronizer, ResourceSynchronizer, GUEST_LOG_TARGET,
};
