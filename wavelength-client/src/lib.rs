pub mod attachment_queue;
pub mod attachment_store;
pub mod auth;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod handler;
pub mod lifecycle;
pub mod processor;
pub mod ptt;
pub mod registry;
pub mod runtime;
pub mod service;
pub mod transport;

pub use config::ClientConfig;
pub use coordinator::{CoordinatorInbox, SessionCoordinator};
pub use error::{AudioError, SessionError};
pub use events::{EventBus, EventKind, EventSubscription, SessionEvent};
pub use runtime::{SessionHandle, spawn_session};
