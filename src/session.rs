//! Session manager: account login, device registration and message sync.
//!
//! # Error model
//!
//! Every network-backed call follows the same pattern: clear the previous
//! reply and errors for that operation, issue the request, decode the
//! status-tagged reply and record it on the session. A non-success status is
//! *not* an `Err`: it comes back as [`ApiOutcome::Rejected`] (or
//! [`LoginOutcome::Rejected`]) and stays observable through the
//! per-operation [`OperationState`].
//!
//! `Err` is reserved for conditions the caller must fix before retrying:
//! missing credentials (see [`CredentialsError`]), transport failures, and
//! malformed success replies.
//!
//! # Two-factor login
//!
//! When the account requires a two-factor code, the first [`Session::login`]
//! returns [`LoginOutcome::NeedsTwofa`] and sets [`Session::needs_twofa`].
//! Supply the code (argument or [`Session::set_twofa`]) and call `login` again.

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use serde_json::Value;

use crate::api::{ApiErrors, ApiReply, ApiTransport, Endpoints, HttpTransport};
use crate::config::Config;
use crate::constants::{
    realtime_login_frame, DEVICE_NAME_MAX_LEN, DEVICE_NAME_PREFIX, DEVICE_OS,
    TWOFA_REQUIRED_STATUS,
};
use crate::credentials::{Credentials, CredentialsError};
use crate::notification::{Notification, NotificationStore};

/// Result of [`Session::login`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginOutcome {
    /// Login succeeded; the new secret is stored on the session.
    Secret(String),
    /// The account needs a two-factor code before login can complete.
    NeedsTwofa,
    /// The server refused the credentials.
    Rejected(ApiErrors),
}

/// Result of an API call that either succeeds with `T` or is refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiOutcome<T> {
    /// The server answered `status == 1`.
    Success(T),
    /// The server answered with an error payload.
    Rejected(ApiErrors),
}

impl<T> ApiOutcome<T> {
    /// Returns `true` for [`ApiOutcome::Success`].
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// Success value, discarding errors.
    pub fn success(self) -> Option<T> {
        match self {
            Self::Success(value) => Some(value),
            Self::Rejected(_) => None,
        }
    }

    /// Convert into a `Result`, turning rejections into an error for `operation`.
    pub fn into_result(self, operation: &str) -> Result<T> {
        match self {
            Self::Success(value) => Ok(value),
            Self::Rejected(errors) => anyhow::bail!("{operation} failed: {errors}"),
        }
    }
}

/// Last reply and error payload of one operation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OperationState {
    /// Raw reply of the last attempt.
    pub reply: Option<ApiReply>,
    /// Errors of the last attempt, if it was refused.
    pub errors: Option<ApiErrors>,
}

impl OperationState {
    fn clear(&mut self) {
        self.reply = None;
        self.errors = None;
    }

    /// Record `reply`, returning its errors when it was not a success.
    fn record(&mut self, reply: &ApiReply) -> Option<ApiErrors> {
        self.reply = Some(reply.clone());
        if reply.is_success() {
            return None;
        }
        let errors = reply.errors();
        self.errors = Some(errors.clone());
        Some(errors)
    }
}

/// Synthesize a device name from `now`: `rust-YYYYmmdd_HHMMSS`.
#[must_use]
pub fn generate_device_name(now: DateTime<Local>) -> String {
    let name = format!("{DEVICE_NAME_PREFIX}-{}", now.format("%Y%m%d_%H%M%S"));
    sanitize_device_name(&name)
}

/// Restrict `name` to `[A-Za-z0-9_-]` and at most 25 characters.
#[must_use]
pub fn sanitize_device_name(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .take(DEVICE_NAME_MAX_LEN)
        .collect()
}

/// Owns credentials, the notification store and the API transport.
pub struct Session {
    transport: Box<dyn ApiTransport>,
    endpoints: Endpoints,
    credentials: Credentials,
    credentials_path: Option<PathBuf>,
    needs_twofa: bool,
    store: NotificationStore,
    login_state: OperationState,
    registration_state: OperationState,
    download_state: OperationState,
    acknowledge_state: OperationState,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("endpoints", &self.endpoints)
            .field("credentials", &self.credentials)
            .field("credentials_path", &self.credentials_path)
            .field("needs_twofa", &self.needs_twofa)
            .field("stored_ids", &self.store.ids().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Create a session over `transport` with in-memory credentials only.
    ///
    /// Nothing is written to disk until [`Self::with_credentials_path`] is set.
    #[must_use]
    pub fn new(
        transport: Box<dyn ApiTransport>,
        endpoints: Endpoints,
        credentials: Credentials,
    ) -> Self {
        Self {
            transport,
            endpoints,
            credentials,
            credentials_path: None,
            needs_twofa: false,
            store: NotificationStore::new(),
            login_state: OperationState::default(),
            registration_state: OperationState::default(),
            download_state: OperationState::default(),
            acknowledge_state: OperationState::default(),
        }
    }

    /// Persist credentials to `path` after successful login/registration.
    pub fn with_credentials_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.credentials_path = Some(path.into());
        self
    }

    /// HTTP session for `config`, with credentials loaded from its credentials file.
    ///
    /// Fails when the file is missing or lacks email/password.
    pub fn from_config(config: &Config) -> Result<Self> {
        let transport = HttpTransport::new()?;
        let mut session = Self::new(
            Box::new(transport),
            Endpoints::new(&config.api_url),
            Credentials::default(),
        )
        .with_credentials_path(&config.credentials_file);
        session.load_credentials()?;
        Ok(session)
    }

    /// Current credentials.
    #[must_use]
    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// API endpoints in use.
    #[must_use]
    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    /// Credentials file, if the session persists credentials.
    #[must_use]
    pub fn credentials_path(&self) -> Option<&Path> {
        self.credentials_path.as_deref()
    }

    /// Downloaded, not yet acknowledged messages.
    #[must_use]
    pub fn store(&self) -> &NotificationStore {
        &self.store
    }

    /// `true` after a login attempt was refused for lack of a two-factor code.
    #[must_use]
    pub fn needs_twofa(&self) -> bool {
        self.needs_twofa
    }

    /// Last login reply and errors.
    #[must_use]
    pub fn login_state(&self) -> &OperationState {
        &self.login_state
    }

    /// Last device registration reply and errors.
    #[must_use]
    pub fn registration_state(&self) -> &OperationState {
        &self.registration_state
    }

    /// Last message download reply and errors.
    #[must_use]
    pub fn download_state(&self) -> &OperationState {
        &self.download_state
    }

    /// Last acknowledgement reply and errors.
    #[must_use]
    pub fn acknowledge_state(&self) -> &OperationState {
        &self.acknowledge_state
    }

    /// Store a two-factor code for the next [`Self::login`].
    pub fn set_twofa(&mut self, code: &str) {
        self.credentials.twofa = Some(code.to_string()).filter(|c| !c.is_empty());
    }

    /// Reload credentials from the credentials file.
    ///
    /// Fields present in the file replace in-memory values; fields absent from
    /// the file leave in-memory values untouched.
    pub fn load_credentials(&mut self) -> Result<()> {
        let path = self
            .credentials_path
            .clone()
            .context("Session has no credentials file configured")?;
        let loaded = Credentials::load_from(&path)?;
        self.credentials.merge_from(loaded);
        log::debug!("[session] Loaded credentials from {}", path.display());
        Ok(())
    }

    /// Write the currently known credential fields to the credentials file.
    pub fn persist_credentials(&self) -> Result<()> {
        let path = self
            .credentials_path
            .as_deref()
            .context("Session has no credentials file configured")?;
        self.credentials.save_to(path)?;
        log::debug!("[session] Wrote credentials to {}", path.display());
        Ok(())
    }

    /// Seed email and password, write them out and read the file back.
    pub fn load_from_email_and_password(&mut self, email: &str, password: &str) -> Result<()> {
        self.credentials
            .merge_from(Credentials::with_login(email, password));
        self.persist_credentials()?;
        self.load_credentials()
    }

    fn persist_if_configured(&self) -> Result<()> {
        if self.credentials_path.is_some() {
            self.persist_credentials()?;
        }
        Ok(())
    }

    /// Log in, acquiring a device secret.
    ///
    /// `email`/`password` default to the stored credentials; `twofa` defaults
    /// to the code stored with [`Self::set_twofa`].
    pub fn login(
        &mut self,
        email: Option<&str>,
        password: Option<&str>,
        twofa: Option<&str>,
    ) -> Result<LoginOutcome> {
        let email = email
            .or(self.credentials.email.as_deref())
            .filter(|e| !e.is_empty())
            .ok_or(CredentialsError::MissingField("email"))?
            .to_string();
        let password = password
            .or(self.credentials.password.as_deref())
            .filter(|p| !p.is_empty())
            .ok_or(CredentialsError::MissingField("password"))?
            .to_string();
        let twofa = twofa
            .or(self.credentials.twofa.as_deref())
            .filter(|c| !c.is_empty())
            .map(str::to_string);

        if self.needs_twofa && twofa.is_none() {
            log::info!("[session] Login needs a two-factor code; not retrying without one");
            return Ok(LoginOutcome::NeedsTwofa);
        }

        self.login_state.clear();

        let mut form = vec![("email", email.as_str()), ("password", password.as_str())];
        if let Some(code) = twofa.as_deref() {
            form.push(("twofa", code));
        }

        let reply = self.transport.post_form(&self.endpoints.login(), &form)?;

        if reply.http_status == TWOFA_REQUIRED_STATUS {
            self.login_state.record(&reply);
            self.credentials.twofa = None;
            self.needs_twofa = true;
            log::info!("[session] Account requires two-factor authentication");
            return Ok(LoginOutcome::NeedsTwofa);
        }
        self.needs_twofa = false;

        if let Some(errors) = self.login_state.record(&reply) {
            errors.log("login");
            return Ok(LoginOutcome::Rejected(errors));
        }

        let secret = reply
            .string_field("secret")
            .context("Login reply is missing 'secret'")?;

        self.credentials.email = Some(email);
        self.credentials.password = Some(password);
        self.credentials.secret = Some(secret.clone());
        self.credentials.twofa = None;
        self.persist_if_configured()?;

        log::info!("[session] Logged in");
        Ok(LoginOutcome::Secret(secret))
    }

    /// Register this client as a new device.
    ///
    /// Without `name`, a timestamp-based name is synthesized. Names are
    /// restricted to `[A-Za-z0-9_-]`, 25 characters.
    pub fn register_device(
        &mut self,
        name: Option<&str>,
        secret: Option<&str>,
    ) -> Result<ApiOutcome<String>> {
        let name = name
            .map(sanitize_device_name)
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| generate_device_name(Local::now()));
        let secret = match secret.filter(|s| !s.is_empty()) {
            Some(secret) => secret.to_string(),
            None => self.credentials.require_secret()?.to_string(),
        };

        self.registration_state.clear();

        let form = [
            ("name", name.as_str()),
            ("os", DEVICE_OS),
            ("secret", secret.as_str()),
        ];
        let reply = self.transport.post_form(&self.endpoints.devices(), &form)?;

        if let Some(errors) = self.registration_state.record(&reply) {
            errors.log("device registration");
            return Ok(ApiOutcome::Rejected(errors));
        }

        let device_id = reply
            .string_field("id")
            .context("Device registration reply is missing 'id'")?;

        self.credentials.device_id = Some(device_id.clone());
        self.persist_if_configured()?;

        log::info!("[session] Registered device '{name}' as {device_id}");
        Ok(ApiOutcome::Success(device_id))
    }

    /// Download every message queued for the device and merge it into the store.
    pub fn download_messages(
        &mut self,
        secret: Option<&str>,
        device_id: Option<&str>,
    ) -> Result<ApiOutcome<Vec<Notification>>> {
        let secret = match secret.filter(|s| !s.is_empty()) {
            Some(secret) => secret.to_string(),
            None => self.credentials.require_secret()?.to_string(),
        };
        let device_id = match device_id.filter(|d| !d.is_empty()) {
            Some(device_id) => device_id.to_string(),
            None => self.credentials.require_device_id()?.to_string(),
        };

        self.download_state.clear();

        let query = [("secret", secret.as_str()), ("device_id", device_id.as_str())];
        let reply = self.transport.get_query(&self.endpoints.messages(), &query)?;

        if let Some(errors) = self.download_state.record(&reply) {
            errors.log("message download");
            return Ok(ApiOutcome::Rejected(errors));
        }

        let raw_messages = match reply.body.get("messages") {
            Some(Value::Array(messages)) => messages.clone(),
            Some(Value::Null) | None => Vec::new(),
            Some(other) => anyhow::bail!("Unexpected 'messages' payload: {other}"),
        };

        let mut messages = Vec::with_capacity(raw_messages.len());
        for raw in raw_messages {
            let notification = match Notification::from_value(raw) {
                Ok(notification) => notification,
                Err(e) => {
                    log::warn!("[session] Skipping message: {e:#}");
                    continue;
                }
            };
            if self.store.merge(notification.clone()) {
                messages.push(notification);
            }
        }

        log::info!("[session] Downloaded {} message(s)", messages.len());
        Ok(ApiOutcome::Success(messages))
    }

    /// Acknowledge every message up to and including `last_id`.
    ///
    /// Without `last_id`, the highest id in the store is used; with an empty
    /// store nothing is sent and `Success(None)` is returned. On success the
    /// acknowledged ids are dropped from the store.
    pub fn delete_all_messages(
        &mut self,
        device_id: Option<&str>,
        secret: Option<&str>,
        last_id: Option<i64>,
    ) -> Result<ApiOutcome<Option<i64>>> {
        let device_id = match device_id.filter(|d| !d.is_empty()) {
            Some(device_id) => device_id.to_string(),
            None => self.credentials.require_device_id()?.to_string(),
        };
        let secret = match secret.filter(|s| !s.is_empty()) {
            Some(secret) => secret.to_string(),
            None => self.credentials.require_secret()?.to_string(),
        };

        let Some(last_id) = last_id.or_else(|| self.store.highest_id()) else {
            log::debug!("[session] No messages to acknowledge");
            return Ok(ApiOutcome::Success(None));
        };

        self.acknowledge_state.clear();

        let last_id_str = last_id.to_string();
        let form = [("secret", secret.as_str()), ("message", last_id_str.as_str())];
        let reply = self
            .transport
            .post_form(&self.endpoints.update_highest_message(&device_id), &form)?;

        if let Some(errors) = self.acknowledge_state.record(&reply) {
            errors.log("message acknowledgement");
            return Ok(ApiOutcome::Rejected(errors));
        }

        let removed = self.store.remove_through(last_id);
        log::info!("[session] Acknowledged messages through {last_id} ({removed} dropped locally)");
        Ok(ApiOutcome::Success(Some(last_id)))
    }

    /// Highest stored message id, optionally downloading first.
    ///
    /// An empty store yields `None`.
    pub fn highest_message_id(&mut self, redownload: bool) -> Result<Option<i64>> {
        if redownload {
            if let ApiOutcome::Rejected(errors) = self.download_messages(None, None)? {
                log::warn!("[session] Redownload before highest id failed: {errors}");
            }
        }
        Ok(self.store.highest_id())
    }

    /// Realtime login frame `login:<device_id>:<secret>\n`.
    pub fn realtime_login_frame(&self) -> Result<String> {
        let device_id = self.credentials.require_device_id()?;
        let secret = self.credentials.require_secret()?;
        Ok(realtime_login_frame(device_id, secret))
    }

    /// Full start-up sequence: login, register a device, download, acknowledge.
    ///
    /// Any refusal aborts with an error, since a half-bootstrapped session
    /// cannot open the realtime channel.
    pub fn bootstrap(&mut self, device_name: Option<&str>) -> Result<()> {
        match self.login(None, None, None)? {
            LoginOutcome::Secret(_) => {}
            LoginOutcome::NeedsTwofa => {
                anyhow::bail!("Login requires a two-factor code")
            }
            LoginOutcome::Rejected(errors) => anyhow::bail!("Login failed: {errors}"),
        }
        self.register_device(device_name, None)?
            .into_result("Device registration")?;
        self.download_messages(None, None)?
            .into_result("Message download")?;
        self.delete_all_messages(None, None, None)?
            .into_result("Message acknowledgement")?;
        Ok(())
    }
}
