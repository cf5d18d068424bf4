//! Background event scripts: which events each one follows and where they go.

pub mod catalog;
pub mod forwarder;

pub use catalog::{find, resolve_enabled, ScriptDefinition, CATALOG};
pub use forwarder::{Forwarder, LoggingForwarder, PageSummary, ScriptHandler, WebhookForwarder};
