//! Connector manager for Conduit
//!
//! Owns the connector side of the integration pipeline: the provider
//! contract, live connector instances, and the integration manager that
//! ties them to the job queues.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                 IntegrationManager                   │
//! │  create / update / delete / sync / restore           │
//! │                                                      │
//! │  ┌────────────────────┐   ┌───────────────────────┐  │
//! │  │ ConnectorRegistry  │   │  sync timers (tokio)  │  │
//! │  │ provider → ctor    │   │  enqueue sync jobs    │  │
//! │  │ (id, provider) →   │   └───────────┬───────────┘  │
//! │  │   ConnectorInstance│               │              │
//! │  └─────────┬──────────┘               │              │
//! └────────────┼──────────────────────────┼──────────────┘
//!              │                          ▼
//!              ▼                  conduit::queue::Dispatcher
//!   smtp | slack | webhook        (integration-sync, outbound-messages,
//!                                  webhook-processing → jobs.rs handlers)
//! ```
//!
//! Connectors implement [`Connector`] plus whichever capability sub-traits
//! they support. [`ConnectorInstance`] wraps one connector with its
//! lifecycle state machine, timeouts and capability checks.

pub mod api;
pub mod connector;
pub mod connectors;
pub mod error;
pub mod instance;
pub mod jobs;
pub mod manager;
pub mod registry;
pub mod types;

pub use connector::{Connector, MessageFetcher, MessageSender, Syncable, WebhookCapable};
pub use error::{classify, ConnectorError, HttpStatusError, IntegrationError};
pub use instance::{ConnectorInstance, InstanceEvent, InstanceStatus};
pub use jobs::{register_job_handlers, SendJob, SyncJob, SEND_JOB_TYPE, SYNC_JOB_TYPE};
pub use manager::{
    spawn_status_listener, IntegrationEvent, IntegrationManager, IntegrationSpec,
    IntegrationUpdate, ManagerConfig,
};
pub use registry::{ConnectorConstructor, ConnectorRegistry, DEFAULT_OPERATION_TIMEOUT};
pub use types::{
    Capability, ConnectorDescriptor, ConnectorKind, ConnectorState, FetchOptions, Message,
    OutboundMessage, SendReceipt, SyncReport, WebhookOutcome, WebhookRegistration,
};
