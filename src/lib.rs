//! Pushover Open Client - receive Pushover notifications on a desktop device.
//!
//! Logs in to the Pushover Open Client API, registers a device, downloads and
//! acknowledges messages, and listens on the realtime WebSocket for new ones.
//! Every message is handed to user-registered handlers and, when the operator
//! allows it, to the shell.
//!
//! # Architecture
//!
//! - **Session** - account state and the REST calls (login, register, download, acknowledge)
//! - **Registry** - dispatch tables keyed by the first word of a message
//! - **Dispatcher** - realtime state machine reacting to server control bytes
//! - **Connection** - async WebSocket loop driving the dispatcher
//!
//! # Modules
//!
//! - [`session`] - REST session and device bootstrap
//! - [`dispatcher`] - control-byte handling and notification fan-out
//! - [`registry`] - handler registration
//! - [`config`] - configuration loading/saving

pub mod api;
pub mod config;
pub mod connection;
pub mod constants;
pub mod credentials;
pub mod dispatcher;
pub mod notification;
pub mod registry;
pub mod session;
pub mod shell;
pub mod ws;

#[cfg(test)]
mod test_support;

// Re-export commonly used types
pub use api::{ApiErrors, ApiReply, ApiTransport, Endpoints, HttpTransport};
pub use config::Config;
pub use credentials::{Credentials, CredentialsError};
pub use dispatcher::{ConnectionState, ControlCode, Dispatcher};
pub use notification::{Notification, NotificationStore};
pub use registry::Registry;
pub use session::{ApiOutcome, LoginOutcome, Session};
pub use shell::{CommandLine, CommandRunner, ShellLine, ShellRunner};
