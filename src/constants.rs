//! Vendor-fixed constants for the Pushover Open Client API.
//!
//! Everything here is dictated by the vendor protocol (endpoint paths,
//! frame formats, naming rules) rather than chosen locally.
//!
//! # Categories
//!
//! - **Endpoints**: REST API base URL and paths
//! - **Realtime**: websocket URL and login frame
//! - **Devices**: device naming rules
//! - **Timeouts**: network timeouts

use std::time::Duration;

// ============================================================================
// Endpoints
// ============================================================================

/// Base URL of the Pushover REST API.
pub const DEFAULT_API_URL: &str = "https://api.pushover.net/1";

/// Login endpoint, relative to the API base URL.
pub const LOGIN_PATH: &str = "users/login.json";

/// Device registration endpoint, relative to the API base URL.
pub const DEVICES_PATH: &str = "devices.json";

/// Message download endpoint, relative to the API base URL.
pub const MESSAGES_PATH: &str = "messages.json";

/// HTTP status returned by the login endpoint when a two-factor code is required.
pub const TWOFA_REQUIRED_STATUS: u16 = 412;

/// Operating system tag sent on device registration ("O" = Open Client).
pub const DEVICE_OS: &str = "O";

// ============================================================================
// Realtime
// ============================================================================

/// Realtime websocket server.
pub const DEFAULT_WEBSOCKET_URL: &str = "wss://client.pushover.net/push";

// ============================================================================
// Devices
// ============================================================================

/// Maximum length of a device name accepted by the server.
pub const DEVICE_NAME_MAX_LEN: usize = 25;

/// Prefix for synthesized device names.
pub const DEVICE_NAME_PREFIX: &str = "rust";

// ============================================================================
// Timeouts
// ============================================================================

/// HTTP client request timeout for API calls.
///
/// Session calls block the realtime loop, so a hung request must not
/// stall keep-alive handling indefinitely.
pub const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Default credentials file name, placed in the user's home directory.
pub const CREDENTIALS_FILENAME: &str = ".pushover-open-client-creds.json";

/// Build the realtime login frame `login:<device_id>:<secret>\n`.
#[must_use]
pub fn realtime_login_frame(device_id: &str, secret: &str) -> String {
    format!("login:{device_id}:{secret}\n")
}
