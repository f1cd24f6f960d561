//! Core library for the `playrun` playbook runner.
//!
//! The crate runs a playbook through one of several execution backends
//! (local interpreter, container, remote shell over SSH, managed cloud
//! shell) under a shared session lifecycle, and keeps a remote copy of the
//! workspace current with an incremental file sync engine. Remote sessions
//! are pooled per host by the [`connection::ConnectionManager`], and every
//! trigger reaches the core through the [`events`] channel.

pub mod backend;
pub mod config;
pub mod connection;
pub mod events;
pub mod exec;
pub mod logging;
pub mod sink;
pub mod sync;
pub mod terminal;
pub mod test_support;

pub use backend::{
    BackendKind, ExecutionRequest, RunError, RunnerBackend, SessionId, SessionManager,
    SessionState,
};
pub use config::{ConfigError, RunnerConfig};
pub use connection::{ConnectionLease, ConnectionManager, HostSpec};
pub use events::{Core, CoreEvent, CoreParts, spawn_event_loop};
pub use exec::{CommandRunner, CommandSpec, ProcessExecutor};
pub use sink::{LogSink, MemorySink, Notifier};
pub use sync::{SyncEngine, SyncResult};
pub use terminal::{TerminalId, TerminalRegistry};
