//! REST plumbing for the Pushover Open Client API.
//!
//! Every endpoint answers with a status-tagged JSON object: `status == 1`
//! means success, anything else carries an `errors` field that is either a
//! list of strings or a map from field name to a list of strings.
//!
//! The HTTP layer sits behind [`ApiTransport`] so the session logic can be
//! driven by a scripted transport in tests.

use std::collections::BTreeMap;
use std::fmt;

use anyhow::{Context, Result};
use reqwest::blocking::{Client, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::{
    DEFAULT_API_URL, DEVICES_PATH, HTTP_REQUEST_TIMEOUT, LOGIN_PATH, MESSAGES_PATH,
};

/// Endpoint table derived from an API base URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    base: String,
}

impl Endpoints {
    /// Build endpoints under `api_url` (trailing slashes are ignored).
    #[must_use]
    pub fn new(api_url: &str) -> Self {
        Self {
            base: api_url.trim_end_matches('/').to_string(),
        }
    }

    /// API base URL without a trailing slash.
    #[must_use]
    pub fn base(&self) -> &str {
        &self.base
    }

    /// `POST` email + password (+ twofa) → secret.
    #[must_use]
    pub fn login(&self) -> String {
        format!("{}/{LOGIN_PATH}", self.base)
    }

    /// `POST` name + os + secret → device id.
    #[must_use]
    pub fn devices(&self) -> String {
        format!("{}/{DEVICES_PATH}", self.base)
    }

    /// `GET` secret + device id → queued messages.
    #[must_use]
    pub fn messages(&self) -> String {
        format!("{}/{MESSAGES_PATH}", self.base)
    }

    /// `POST` secret + message id → acknowledge everything up to that id.
    #[must_use]
    pub fn update_highest_message(&self, device_id: &str) -> String {
        format!(
            "{}/devices/{device_id}/update_highest_message.json",
            self.base
        )
    }
}

impl Default for Endpoints {
    fn default() -> Self {
        Self::new(DEFAULT_API_URL)
    }
}

/// Error payload of a failed API call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ApiErrors {
    /// Plain list of messages.
    List(Vec<String>),
    /// Messages keyed by the offending request field.
    Fields(BTreeMap<String, Vec<String>>),
}

impl ApiErrors {
    /// Flatten into printable lines; field errors render as `"<field> - <error>"`.
    #[must_use]
    pub fn messages(&self) -> Vec<String> {
        match self {
            Self::List(errors) => errors.clone(),
            Self::Fields(fields) => fields
                .iter()
                .flat_map(|(field, errors)| {
                    errors.iter().map(move |error| format!("{field} - {error}"))
                })
                .collect(),
        }
    }

    /// Returns `true` if the payload carries no messages at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::List(errors) => errors.is_empty(),
            Self::Fields(fields) => fields.values().all(Vec::is_empty),
        }
    }

    /// Log every message at warn level, tagged with the failed operation.
    pub fn log(&self, operation: &str) {
        for message in self.messages() {
            log::warn!("[api] {operation} failed: {message}");
        }
    }
}

impl fmt::Display for ApiErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.messages().join("; "))
    }
}

/// Raw reply from an API endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiReply {
    /// HTTP status code.
    pub http_status: u16,
    /// Decoded JSON body (`Null` when the body was not JSON).
    pub body: Value,
}

impl ApiReply {
    /// Returns `true` when the body is tagged `status == 1`.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.body.get("status").and_then(Value::as_i64) == Some(1)
    }

    /// Error payload of a failed reply.
    ///
    /// Falls back to a single synthesized message when the server sent no
    /// recognizable `errors` field.
    #[must_use]
    pub fn errors(&self) -> ApiErrors {
        self.body
            .get("errors")
            .and_then(|errors| serde_json::from_value::<ApiErrors>(errors.clone()).ok())
            .filter(|errors| !errors.is_empty())
            .unwrap_or_else(|| {
                ApiErrors::List(vec![format!(
                    "request failed with HTTP {} and no error details",
                    self.http_status
                )])
            })
    }

    /// String field of the body. Numeric ids are rendered as strings.
    #[must_use]
    pub fn string_field(&self, key: &str) -> Option<String> {
        match self.body.get(key)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

/// HTTP seam used by [`crate::session::Session`].
///
/// Implementations perform one blocking request and decode the reply.
/// Transport failures (DNS, TLS, timeouts) are `Err`; non-success API
/// statuses are ordinary replies.
pub trait ApiTransport {
    /// `POST` an url-encoded form.
    fn post_form(&self, url: &str, form: &[(&str, &str)]) -> Result<ApiReply>;

    /// `GET` with query parameters.
    fn get_query(&self, url: &str, query: &[(&str, &str)]) -> Result<ApiReply>;
}

/// Blocking reqwest implementation of [`ApiTransport`].
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    /// Create a transport with the default request timeout.
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .timeout(HTTP_REQUEST_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client })
    }
}

impl ApiTransport for HttpTransport {
    fn post_form(&self, url: &str, form: &[(&str, &str)]) -> Result<ApiReply> {
        let response = self
            .client
            .post(url)
            .form(form)
            .send()
            .with_context(|| format!("POST {url} failed"))?;
        into_reply(response)
    }

    fn get_query(&self, url: &str, query: &[(&str, &str)]) -> Result<ApiReply> {
        let response = self
            .client
            .get(url)
            .query(query)
            .send()
            .with_context(|| format!("GET {url} failed"))?;
        into_reply(response)
    }
}

fn into_reply(response: Response) -> Result<ApiReply> {
    let http_status = response.status().as_u16();
    let text = response
        .text()
        .context("Failed to read API response body")?;

    let body = serde_json::from_str(&text).unwrap_or_else(|e| {
        log::warn!("[api] Non-JSON response body (HTTP {http_status}): {e}");
        Value::Null
    });

    Ok(ApiReply { http_status, body })
}
