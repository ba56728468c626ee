pub mod consumer_loop;
pub mod dispatcher;
pub mod jobs;
pub mod manager;
pub mod matcher;
pub mod registry;
pub mod settings;

pub use consumer_loop::{ConsumerLoop, LoopMonitor, LoopOptions, LoopReleaser, LoopState, LoopStats};
pub use dispatcher::{
    BuildParameter, ChannelDispatcher, DispatchRequest, Dispatcher, LogDispatcher, WebhookDispatcher,
};
pub use jobs::{JobCatalog, JobDefinition, SyncReport};
pub use manager::{ApplyOutcome, ConnectionManager, ConnectionStatus, ManagerOptions};
pub use matcher::{match_message, reconcile_parameters};
pub use registry::{RegistrySnapshot, SubscriberRegistry};
pub use settings::{DaemonSettings, DispatchSettings, RuntimeSettings};

pub use ktrigger_core::{ConnectionConfig, Subscriber, TriggerError};
