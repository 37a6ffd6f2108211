//! Realtime dispatcher: reacts to control bytes and fans notifications out.
//!
//! # Lifecycle
//!
//! ```text
//!   Disconnected ──start()──► Connecting ──on_open()──► Connected
//!        ▲                                                  │
//!        └──────────── on_close() / on_error() ─────────────┘
//! ```
//!
//! The transport (see [`crate::connection`]) calls the four hooks
//! [`Dispatcher::on_open`], [`Dispatcher::on_message`],
//! [`Dispatcher::on_error`] and [`Dispatcher::on_close`]. `on_open` hands
//! back the login frame to send. Every inbound frame is a single control
//! byte:
//!
//! | byte | meaning | reaction |
//! |---|---|---|
//! | `#` | keep-alive | none |
//! | `!` | new messages | [`Dispatcher::sync`] |
//! | `R` | reload requested | logged only; reconnecting is the caller's call |
//! | `E` | permanent error | fresh bootstrap replaces the session |
//! | `A` | logged in elsewhere | logged only; must not reconnect |
//!
//! Unknown bytes are logged and ignored.
//!
//! Handling is synchronous: a slow handler delays the next frame,
//! keep-alives included.

use std::fmt;
use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::api::{Endpoints, HttpTransport};
use crate::credentials::Credentials;
use crate::notification::Notification;
use crate::registry::Registry;
use crate::session::{ApiOutcome, Session};
use crate::shell::{CommandRunner, ShellLine, ShellRunner};

/// Control byte sent by the realtime server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCode {
    /// `#`: keep-alive packet, no response needed.
    KeepAlive,
    /// `!`: a new message has arrived; sync.
    Sync,
    /// `R`: drop the connection and reconnect.
    Reload,
    /// `E`: permanent problem; do not reconnect automatically.
    PermanentError,
    /// `A`: the device logged in from another session.
    SessionSuperseded,
}

impl ControlCode {
    /// Decode a single control byte.
    #[must_use]
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b'#' => Some(Self::KeepAlive),
            b'!' => Some(Self::Sync),
            b'R' => Some(Self::Reload),
            b'E' => Some(Self::PermanentError),
            b'A' => Some(Self::SessionSuperseded),
            _ => None,
        }
    }

    /// Decode a whole frame; only single-byte frames are control codes.
    #[must_use]
    pub fn from_frame(frame: &[u8]) -> Option<Self> {
        match frame {
            [byte] => Self::from_byte(*byte),
            _ => None,
        }
    }

    /// Wire byte of this code.
    #[must_use]
    pub fn as_byte(self) -> u8 {
        match self {
            Self::KeepAlive => b'#',
            Self::Sync => b'!',
            Self::Reload => b'R',
            Self::PermanentError => b'E',
            Self::SessionSuperseded => b'A',
        }
    }

    /// Vendor description of the code.
    #[must_use]
    pub fn meaning(self) -> &'static str {
        match self {
            Self::KeepAlive => "Keep-alive packet, no response needed.",
            Self::Sync => "A new message has arrived; you should perform a sync.",
            Self::Reload => "Reload request; you should drop your connection and re-connect.",
            Self::PermanentError => {
                "Error; a permanent problem occured and you should not automatically \
                 re-connect. Prompt the user to login again or re-enable the device."
            }
            Self::SessionSuperseded => {
                "Error; the device logged in from another session and this session is \
                 being closed. Do not automatically re-connect."
            }
        }
    }
}

/// Connection lifecycle as seen by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection.
    Disconnected,
    /// Connection requested, not yet open.
    Connecting,
    /// Open and logged in.
    Connected,
}

/// Produces a freshly bootstrapped session after a permanent error.
pub type BootstrapFn = Box<dyn FnMut() -> Result<Session>>;

/// Bootstrap a new HTTP session from the credentials file at `path`.
fn bootstrap_from_file(
    endpoints: Endpoints,
    path: Option<PathBuf>,
    device_name: Option<String>,
) -> BootstrapFn {
    Box::new(move || {
        let path = path
            .clone()
            .context("No credentials file to bootstrap a new session from")?;
        let mut session = Session::new(
            Box::new(HttpTransport::new()?),
            endpoints.clone(),
            Credentials::default(),
        )
        .with_credentials_path(path);
        session.load_credentials()?;
        session.bootstrap(device_name.as_deref())?;
        Ok(session)
    })
}

/// Owns the active session and the dispatch tables for one realtime connection.
pub struct Dispatcher {
    session: Session,
    registry: Registry,
    runner: Box<dyn CommandRunner>,
    bootstrap: BootstrapFn,
    state: ConnectionState,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("session", &self.session)
            .field("registry", &self.registry)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Dispatcher over `session`, running shell entries through [`ShellRunner`].
    ///
    /// A permanent error re-bootstraps from the session's credentials file.
    #[must_use]
    pub fn new(session: Session, registry: Registry) -> Self {
        let bootstrap = bootstrap_from_file(
            session.endpoints().clone(),
            session.credentials_path().map(PathBuf::from),
            None,
        );
        Self {
            session,
            registry,
            runner: Box::new(ShellRunner),
            bootstrap,
            state: ConnectionState::Disconnected,
        }
    }

    /// Replace the shell runner.
    pub fn with_runner(mut self, runner: impl CommandRunner + 'static) -> Self {
        self.runner = Box::new(runner);
        self
    }

    /// Replace how a new session is built after a permanent error.
    pub fn with_bootstrap(mut self, bootstrap: impl FnMut() -> Result<Session> + 'static) -> Self {
        self.bootstrap = Box::new(bootstrap);
        self
    }

    /// Re-bootstrap with `device_name` instead of a synthesized one.
    pub fn with_device_name(mut self, device_name: Option<String>) -> Self {
        self.bootstrap = bootstrap_from_file(
            self.session.endpoints().clone(),
            self.session.credentials_path().map(PathBuf::from),
            device_name,
        );
        self
    }

    /// Active session.
    #[must_use]
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Dispatch tables.
    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Dispatch tables, for registration.
    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// The transport is about to connect.
    pub fn start(&mut self) {
        self.state = ConnectionState::Connecting;
    }

    /// The connection opened; returns the login frame to send immediately.
    ///
    /// Fails when the session has no device id or secret.
    pub fn on_open(&mut self) -> Result<String> {
        let frame = self.session.realtime_login_frame()?;
        self.state = ConnectionState::Connected;
        log::info!("[dispatcher] Connected, logging in");
        Ok(frame)
    }

    /// Handle one inbound frame, returning the control code it carried.
    pub fn on_message(&mut self, frame: &[u8]) -> Option<ControlCode> {
        if self.state != ConnectionState::Connected {
            log::debug!("[dispatcher] Frame received while {:?}", self.state);
        }

        let Some(code) = ControlCode::from_frame(frame) else {
            log::warn!(
                "[dispatcher] Ignoring unknown frame {:?}",
                String::from_utf8_lossy(frame)
            );
            return None;
        };
        log::debug!("[dispatcher] {} {}", char::from(code.as_byte()), code.meaning());

        match code {
            ControlCode::KeepAlive => {}
            ControlCode::Sync => {
                if let Err(e) = self.sync() {
                    log::error!("[dispatcher] Sync failed: {e:#}");
                }
            }
            ControlCode::Reload => {
                log::info!("[dispatcher] Server requested a reload; reconnecting is left to the caller");
            }
            ControlCode::PermanentError => self.rebootstrap(),
            ControlCode::SessionSuperseded => {
                log::warn!("[dispatcher] Device logged in from another session; not reconnecting");
            }
        }

        Some(code)
    }

    /// The transport failed; the connection is over.
    pub fn on_error(&mut self, error: &anyhow::Error) {
        log::warn!("[dispatcher] Connection error: {error:#}");
        self.state = ConnectionState::Disconnected;
    }

    /// The connection closed.
    pub fn on_close(&mut self, code: Option<u16>, reason: &str) {
        match code {
            Some(code) => log::info!("[dispatcher] Connection closed ({code}) {reason}"),
            None => log::info!("[dispatcher] Connection closed: {reason}"),
        }
        self.state = ConnectionState::Disconnected;
    }

    /// Download, acknowledge, then dispatch every downloaded message.
    ///
    /// A refused download stops the sync; a refused acknowledgement is logged
    /// and the downloaded messages are still dispatched.
    pub fn sync(&mut self) -> Result<()> {
        let messages = match self.session.download_messages(None, None)? {
            ApiOutcome::Success(messages) => messages,
            ApiOutcome::Rejected(errors) => {
                log::warn!("[dispatcher] Sync skipped, download refused: {errors}");
                return Ok(());
            }
        };

        if let ApiOutcome::Rejected(errors) = self.session.delete_all_messages(None, None, None)? {
            log::warn!("[dispatcher] Acknowledgement refused: {errors}");
        }

        self.process_notifications(&messages);
        Ok(())
    }

    fn rebootstrap(&mut self) {
        log::warn!("[dispatcher] Permanent error from server, bootstrapping a new session");
        match (self.bootstrap)() {
            Ok(session) => {
                self.session = session;
                log::info!("[dispatcher] Session replaced");
            }
            Err(e) => log::error!("[dispatcher] Bootstrap failed, keeping old session: {e:#}"),
        }
    }

    /// Dispatch a batch of notifications in order.
    pub fn process_notifications(&mut self, notifications: &[Notification]) {
        for notification in notifications {
            self.process_notification(notification);
        }
    }

    /// Run every matching registry entry for `notification`.
    ///
    /// The first word of the message is looked up independently in the
    /// command-function, command-parser, shell-command and shell-alias tables;
    /// every match fires. Parsers then run unconditionally.
    pub fn process_notification(&mut self, notification: &Notification) {
        log::debug!(
            "[dispatcher] Dispatching message {:?} from {}",
            notification.id(),
            notification.field("app")
        );
        let words = notification.words();

        if let Some(command) = notification.command_word() {
            if let Some(handler) = self.registry.command_function_mut(command) {
                if let Err(e) = handler(&words, notification) {
                    log::warn!("[dispatcher] Command '{command}' failed: {e:#}");
                }
            }

            if let Some(parser) = self.registry.command_parser_mut(command) {
                if let Err(e) = parser(notification) {
                    log::warn!("[dispatcher] Command parser '{command}' failed: {e:#}");
                }
            }

            if self.registry.is_shell_command(command) {
                let line = ShellLine::new(notification.message().unwrap_or_default().trim());
                run_shell(self.runner.as_mut(), &line);
            }

            if let Some(command_line) = self.registry.shell_alias(command) {
                let line = command_line.to_shell_line();
                run_shell(self.runner.as_mut(), &line);
            }
        }

        for (name, parser) in self.registry.parsers_mut() {
            if let Err(e) = parser(notification) {
                log::warn!("[dispatcher] Parser '{name}' failed: {e:#}");
            }
        }
    }
}

fn run_shell(runner: &mut dyn CommandRunner, line: &ShellLine) {
    if let Err(e) = runner.run(line) {
        log::warn!("[dispatcher] Shell execution failed: {e:#}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{reply, RecordingRunner, ScriptedTransport};
    use serde_json::json;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn dispatcher(transport: &ScriptedTransport) -> (Dispatcher, RecordingRunner) {
        let credentials = Credentials {
            secret: Some("sec".to_string()),
            device_id: Some("dev".to_string()),
            ..Credentials::with_login("a@b.c", "pw")
        };
        let session = Session::new(
            Box::new(transport.clone()),
            Endpoints::new("https://api.test/1"),
            credentials,
        );
        let runner = RecordingRunner::new();
        let dispatcher = Dispatcher::new(session, Registry::new())
            .with_runner(runner.clone())
            .with_bootstrap(|| anyhow::bail!("bootstrap not scripted"));
        (dispatcher, runner)
    }

    fn message(id: i64, text: &str) -> Notification {
        Notification::from_value(json!({ "id": id, "message": text })).unwrap()
    }

    #[test]
    fn test_control_code_table() {
        for byte in [b'#', b'!', b'R', b'E', b'A'] {
            let code = ControlCode::from_byte(byte).unwrap();
            assert_eq!(code.as_byte(), byte);
            assert!(!code.meaning().is_empty());
        }
        assert_eq!(ControlCode::from_byte(b'x'), None);
        assert_eq!(ControlCode::from_frame(b"!!"), None);
        assert_eq!(ControlCode::from_frame(b""), None);
    }

    #[test]
    fn test_lifecycle_states() {
        let transport = ScriptedTransport::new();
        let (mut dispatcher, _) = dispatcher(&transport);
        assert_eq!(dispatcher.state(), ConnectionState::Disconnected);

        dispatcher.start();
        assert_eq!(dispatcher.state(), ConnectionState::Connecting);

        assert_eq!(dispatcher.on_open().unwrap(), "login:dev:sec\n");
        assert_eq!(dispatcher.state(), ConnectionState::Connected);

        dispatcher.on_close(Some(1000), "bye");
        assert_eq!(dispatcher.state(), ConnectionState::Disconnected);

        dispatcher.start();
        dispatcher.on_error(&anyhow::anyhow!("reset by peer"));
        assert_eq!(dispatcher.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_keepalive_and_unknown_frames_do_nothing() {
        let transport = ScriptedTransport::new();
        let (mut dispatcher, _) = dispatcher(&transport);
        dispatcher.start();
        dispatcher.on_open().unwrap();

        assert_eq!(dispatcher.on_message(b"#"), Some(ControlCode::KeepAlive));
        assert_eq!(dispatcher.on_message(b"?"), None);
        assert_eq!(dispatcher.on_message(b"hello"), None);
        assert!(transport.requests().is_empty());
        assert_eq!(dispatcher.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_reload_and_superseded_are_no_ops() {
        let transport = ScriptedTransport::new();
        let (mut dispatcher, _) = dispatcher(&transport);
        dispatcher.start();
        dispatcher.on_open().unwrap();

        assert_eq!(dispatcher.on_message(b"R"), Some(ControlCode::Reload));
        assert_eq!(dispatcher.on_message(b"A"), Some(ControlCode::SessionSuperseded));
        assert!(transport.requests().is_empty());
        assert_eq!(dispatcher.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_command_function_and_parser_both_fire() {
        let transport = ScriptedTransport::new();
        let (mut dispatcher, _) = dispatcher(&transport);
        let seen_args = Rc::new(RefCell::new(Vec::new()));
        let seen_parser = Rc::new(RefCell::new(Vec::new()));

        let args = Rc::clone(&seen_args);
        let parsed = Rc::clone(&seen_parser);
        dispatcher
            .registry_mut()
            .add_command_function("ping", move |words, record| {
                args.borrow_mut().push((words.to_vec(), record.id()));
                Ok(())
            })
            .add_parser("all", move |record| {
                parsed.borrow_mut().push(record.id());
                Ok(())
            });

        dispatcher.process_notification(&message(1, "ping arg1 arg2"));

        assert_eq!(
            *seen_args.borrow(),
            vec![(
                vec!["ping".to_string(), "arg1".to_string(), "arg2".to_string()],
                Some(1)
            )]
        );
        assert_eq!(*seen_parser.borrow(), vec![Some(1)]);
    }

    #[test]
    fn test_command_parser_receives_record_only_on_match() {
        let transport = ScriptedTransport::new();
        let (mut dispatcher, _) = dispatcher(&transport);
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        dispatcher.registry_mut().add_command_parser("weather", move |record| {
            sink.borrow_mut().push(record.message().map(str::to_string));
            Ok(())
        });

        dispatcher.process_notification(&message(1, "weather today"));
        dispatcher.process_notification(&message(2, "other weather"));

        assert_eq!(*seen.borrow(), vec![Some("weather today".to_string())]);
    }

    #[test]
    fn test_shell_alias_runs_configured_line_only() {
        let transport = ScriptedTransport::new();
        let (mut dispatcher, runner) = dispatcher(&transport);
        dispatcher.registry_mut().add_shell_alias("wake", "echo hi");

        dispatcher.process_notification(&message(1, "wake"));
        dispatcher.process_notification(&message(2, "wake; rm -rf /"));
        dispatcher.process_notification(&message(3, "wake now please"));

        assert_eq!(runner.lines(), vec!["echo hi", "echo hi"]);
    }

    #[test]
    fn test_shell_command_passes_whole_message() {
        let transport = ScriptedTransport::new();
        let (mut dispatcher, runner) = dispatcher(&transport);
        dispatcher.registry_mut().add_shell_command("notify-send");

        dispatcher.process_notification(&message(1, "notify-send hello there"));
        dispatcher.process_notification(&message(2, "rm -rf /"));

        assert_eq!(runner.lines(), vec!["notify-send hello there"]);
    }

    #[test]
    fn test_empty_message_still_reaches_parsers() {
        let transport = ScriptedTransport::new();
        let (mut dispatcher, runner) = dispatcher(&transport);
        let count = Rc::new(RefCell::new(0));
        let counter = Rc::clone(&count);
        dispatcher.registry_mut().add_shell_command("echo").add_parser("count", move |_| {
            *counter.borrow_mut() += 1;
            Ok(())
        });

        dispatcher.process_notification(&Notification::default());

        assert_eq!(*count.borrow(), 1);
        assert!(runner.lines().is_empty());
    }

    #[test]
    fn test_failing_handler_does_not_stop_others() {
        let transport = ScriptedTransport::new();
        let (mut dispatcher, _) = dispatcher(&transport);
        let reached = Rc::new(RefCell::new(false));
        let flag = Rc::clone(&reached);
        dispatcher
            .registry_mut()
            .add_command_function("boom", |_, _| anyhow::bail!("handler exploded"))
            .add_parser("after", move |_| {
                *flag.borrow_mut() = true;
                Ok(())
            });

        dispatcher.process_notification(&message(1, "boom"));

        assert!(*reached.borrow());
    }

    #[test]
    fn test_sync_downloads_acknowledges_and_dispatches() {
        let transport = ScriptedTransport::new();
        transport.push(reply(
            200,
            json!({ "status": 1, "messages": [
                { "id": 11, "message": "first" },
                { "id": 12, "message": "second" }
            ]}),
        ));
        transport.push(reply(200, json!({ "status": 1 })));
        let (mut dispatcher, _) = dispatcher(&transport);
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        dispatcher.registry_mut().add_parser("collect", move |record| {
            sink.borrow_mut().push(record.id());
            Ok(())
        });
        dispatcher.start();
        dispatcher.on_open().unwrap();

        assert_eq!(dispatcher.on_message(b"!"), Some(ControlCode::Sync));

        assert_eq!(*seen.borrow(), vec![Some(11), Some(12)]);
        let requests = transport.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].param("message"), Some("12"));
        assert!(dispatcher.session().store().is_empty());
    }

    #[test]
    fn test_sync_with_mistyped_fields_still_acknowledges_and_dispatches() {
        let transport = ScriptedTransport::new();
        transport.push(reply(
            200,
            json!({ "status": 1, "messages": [
                { "id": 1, "message": "ping a" },
                { "id": 2, "message": "hello", "html": true }
            ]}),
        ));
        transport.push(reply(200, json!({ "status": 1 })));
        let (mut dispatcher, _) = dispatcher(&transport);
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        dispatcher.registry_mut().add_parser("collect", move |record| {
            sink.borrow_mut().push(record.id());
            Ok(())
        });

        dispatcher.on_message(b"!");

        assert_eq!(*seen.borrow(), vec![Some(1), Some(2)]);
        let requests = transport.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(
            requests[1].url,
            "https://api.test/1/devices/dev/update_highest_message.json"
        );
        assert_eq!(requests[1].param("message"), Some("2"));
        assert!(dispatcher.session().store().is_empty());
    }

    #[test]
    fn test_sync_with_refused_download_dispatches_nothing() {
        let transport = ScriptedTransport::new();
        transport.push(reply(200, json!({ "status": 0, "errors": ["secret is invalid"] })));
        let (mut dispatcher, _) = dispatcher(&transport);
        let count = Rc::new(RefCell::new(0));
        let counter = Rc::clone(&count);
        dispatcher.registry_mut().add_parser("count", move |_| {
            *counter.borrow_mut() += 1;
            Ok(())
        });

        dispatcher.on_message(b"!");

        assert_eq!(*count.borrow(), 0);
        assert_eq!(transport.requests().len(), 1);
    }

    #[test]
    fn test_transport_failure_during_sync_is_contained() {
        let transport = ScriptedTransport::new();
        let (mut dispatcher, _) = dispatcher(&transport);
        dispatcher.start();
        dispatcher.on_open().unwrap();

        // No scripted reply: the transport errors out.
        assert_eq!(dispatcher.on_message(b"!"), Some(ControlCode::Sync));
        assert_eq!(dispatcher.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_permanent_error_replaces_session() {
        let transport = ScriptedTransport::new();
        let (dispatcher, _) = dispatcher(&transport);
        let fresh_transport = ScriptedTransport::new();
        let mut dispatcher = dispatcher.with_bootstrap(move || {
            let credentials = Credentials {
                secret: Some("new-sec".to_string()),
                device_id: Some("new-dev".to_string()),
                ..Credentials::with_login("a@b.c", "pw")
            };
            Ok(Session::new(
                Box::new(fresh_transport.clone()),
                Endpoints::new("https://api.test/1"),
                credentials,
            ))
        });

        assert_eq!(dispatcher.on_message(b"E"), Some(ControlCode::PermanentError));

        assert_eq!(
            dispatcher.session().realtime_login_frame().unwrap(),
            "login:new-dev:new-sec\n"
        );
    }

    #[test]
    fn test_failed_bootstrap_keeps_old_session() {
        let transport = ScriptedTransport::new();
        let (mut dispatcher, _) = dispatcher(&transport);

        dispatcher.on_message(b"E");

        assert_eq!(
            dispatcher.session().realtime_login_frame().unwrap(),
            "login:dev:sec\n"
        );
    }

    #[test]
    fn test_on_open_without_device_is_fatal() {
        let transport = ScriptedTransport::new();
        let session = Session::new(
            Box::new(transport.clone()),
            Endpoints::new("https://api.test/1"),
            Credentials::with_login("a@b.c", "pw"),
        );
        let mut dispatcher = Dispatcher::new(session, Registry::new());
        dispatcher.start();

        assert!(dispatcher.on_open().is_err());
        assert_eq!(dispatcher.state(), ConnectionState::Connecting);
    }
}
