//! Account credentials and their on-disk JSON record.
//!
//! # Storage
//!
//! A small JSON object at `~/.pushover-open-client-creds.json` (overridable
//! through [`crate::config::Config`]) with the keys `email`, `password`,
//! `secret` and `device_id`. Only keys that currently hold a value are
//! written; there are never `null` placeholders in the file.
//!
//! The two-factor code is held in memory only.

use std::fmt;
use std::fs;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::constants::CREDENTIALS_FILENAME;

/// Configuration errors that abort a call outright.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialsError {
    /// The credentials file does not exist.
    FileNotFound(PathBuf),
    /// A field required by the operation is unset.
    MissingField(&'static str),
}

impl fmt::Display for CredentialsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FileNotFound(path) => write!(
                f,
                "Credentials file '{}' not found. Please create it.",
                path.display()
            ),
            Self::MissingField(field) => write!(f, "Credentials are missing '{field}'"),
        }
    }
}

impl std::error::Error for CredentialsError {}

/// Account and device credentials.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// Account email.
    #[serde(default, skip_serializing_if = "is_blank")]
    pub email: Option<String>,
    /// Account password.
    #[serde(default, skip_serializing_if = "is_blank")]
    pub password: Option<String>,
    /// Per-device secret returned by login.
    #[serde(default, skip_serializing_if = "is_blank")]
    pub secret: Option<String>,
    /// Registered device id.
    #[serde(default, skip_serializing_if = "is_blank")]
    pub device_id: Option<String>,
    /// Two-factor code for the next login attempt. Never persisted.
    #[serde(skip)]
    pub twofa: Option<String>,
}

// Signature dictated by serde's `skip_serializing_if`.
fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().is_none_or(str::is_empty)
}

/// Treat empty strings as unset.
fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .field("device_id", &self.device_id)
            .field("twofa", &self.twofa.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl Credentials {
    /// Credentials holding only an email and password.
    #[must_use]
    pub fn with_login(email: &str, password: &str) -> Self {
        Self {
            email: non_empty(Some(email.to_string())),
            password: non_empty(Some(password.to_string())),
            ..Self::default()
        }
    }

    /// Default per-user credentials path (`~/.pushover-open-client-creds.json`).
    pub fn default_path() -> Result<PathBuf> {
        dirs::home_dir()
            .map(|home| home.join(CREDENTIALS_FILENAME))
            .context("Could not determine home directory for credentials file")
    }

    /// Read a credentials file.
    ///
    /// The file must exist and hold at least `email` and `password`. Unknown
    /// keys are ignored.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(CredentialsError::FileNotFound(path.to_path_buf()).into());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read credentials file {}", path.display()))?;
        let mut loaded: Self = serde_json::from_str(&content)
            .with_context(|| format!("Invalid credentials file {}", path.display()))?;

        loaded.email = non_empty(loaded.email);
        loaded.password = non_empty(loaded.password);
        loaded.secret = non_empty(loaded.secret);
        loaded.device_id = non_empty(loaded.device_id);

        if loaded.email.is_none() {
            return Err(CredentialsError::MissingField("email").into());
        }
        if loaded.password.is_none() {
            return Err(CredentialsError::MissingField("password").into());
        }

        Ok(loaded)
    }

    /// Write the present fields as pretty JSON (owner read/write only on unix).
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("Failed to write credentials file {}", path.display()))?;

        #[cfg(unix)]
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;

        Ok(())
    }

    /// Copy every field `other` holds; fields `other` lacks are left alone.
    pub fn merge_from(&mut self, other: Self) {
        if let Some(email) = non_empty(other.email) {
            self.email = Some(email);
        }
        if let Some(password) = non_empty(other.password) {
            self.password = Some(password);
        }
        if let Some(secret) = non_empty(other.secret) {
            self.secret = Some(secret);
        }
        if let Some(device_id) = non_empty(other.device_id) {
            self.device_id = Some(device_id);
        }
        if let Some(twofa) = non_empty(other.twofa) {
            self.twofa = Some(twofa);
        }
    }

    /// Secret, or a [`CredentialsError::MissingField`] error.
    pub fn require_secret(&self) -> Result<&str> {
        self.secret
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| CredentialsError::MissingField("secret").into())
    }

    /// Device id, or a [`CredentialsError::MissingField`] error.
    pub fn require_device_id(&self) -> Result<&str> {
        self.device_id
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| CredentialsError::MissingField("device_id").into())
    }
}
