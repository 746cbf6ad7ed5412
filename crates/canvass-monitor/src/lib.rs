//! Live view over a campaign's canvassing sessions: polls the session list,
//! keeps one update stream per active session and folds both into a summary.

pub mod config;
pub mod error;
pub mod event;
pub mod logging;
pub mod merger;
pub mod monitor;
pub mod poller;
pub mod registry;
pub mod reporter;
pub mod runtime;
pub mod transport;

pub use config::{load_config, Args, EmitMode, MonitorConfig};
pub use error::{ConfigError, PollError, TransportError};
pub use event::{ConnectionEvent, ConnectionEventKind, ConnectionSerial, MonitorEvent};
pub use merger::{MergeOutcome, SnapshotStore};
pub use monitor::Monitor;
pub use poller::{HttpSessionSource, SessionSource, SnapshotPoller};
pub use registry::{
    ConnectionHandle, ConnectionRegistry, ConnectionState, Connector, ReconcileReport,
    RegistryHealth,
};
pub use reporter::{summarize, AggregateView, ConnectionHealth};
pub use runtime::{drive, run};
pub use transport::{session_endpoint, WsConnector};
