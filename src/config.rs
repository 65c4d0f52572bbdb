//! Support for gateway configuration options

use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use once_cell::sync::Lazy;

/// Part of the ProdID string that describes the organization (example of a ProdID string: `-//ABC Corporation//My Product//EN`).
/// Feel free to override it when initing this library.
pub static ORG_NAME: Lazy<Arc<Mutex<String>>> = Lazy::new(|| Arc::new(Mutex::new("My organization".to_string())));

/// Part of the ProdID string that describes the product name (example of a ProdID string: `-//ABC Corporation//My Product//EN`).
/// Feel free to override it when initing this library.
pub static PRODUCT_NAME: Lazy<Arc<Mutex<String>>> = Lazy::new(|| Arc::new(Mutex::new("IFB Gateway".to_string())));


/// The account the gateway talks to the server with.
///
/// This is provided by whatever manages the user settings, and is never modified by the gateway.
/// Changing it requires a stop/reconfigure/start cycle of the [`Gateway`](crate::Gateway).
#[derive(Clone, PartialEq, Eq)]
pub struct GatewayConfiguration {
    base_url: String,
    username: String,
    secret: String,
}

impl GatewayConfiguration {
    pub fn new<S: AsRef<str>, T: ToString, U: ToString>(base_url: S, username: T, secret: U) -> Self {
        Self {
            base_url: base_url.as_ref().trim().trim_end_matches('/').to_string(),
            username: username.to_string().trim().to_string(),
            secret: secret.to_string(),
        }
    }

    /// The server URL, without any trailing slash
    pub fn base_url(&self) -> &str { &self.base_url }
    pub fn username(&self) -> &str { &self.username }
    pub fn secret(&self) -> &str { &self.secret }

    /// Whether every field is set. An incomplete configuration cannot be used to start a gateway
    pub fn is_complete(&self) -> bool {
        self.base_url.is_empty() == false
            && self.username.is_empty() == false
            && self.secret.is_empty() == false
    }

    /// A key that identifies this account, used to tell whether a persisted cache belongs to it
    pub fn account_key(&self) -> String {
        format!("{}@{}", self.username.to_lowercase(), self.base_url.to_lowercase())
    }
}

impl fmt::Debug for GatewayConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("GatewayConfiguration")
            .field("base_url", &self.base_url)
            .field("username", &self.username)
            .field("secret", &"<redacted>")
            .finish()
    }
}


/// Default number of days covered by a free/busy query
pub const DEFAULT_WINDOW_DAYS: u32 = 30;
/// Largest number of days a client can ask for
pub const MAX_WINDOW_DAYS: u32 = 365;

/// How the gateway itself behaves
#[derive(Clone, Debug)]
pub struct GatewaySettings {
    /// Loopback port to listen on. `0` lets the OS pick one
    pub port: u16,
    /// First path segment of every request, e.g. `ifb` for `/ifb/freebusy/john.vfb`
    pub prefix: String,
    /// How long a directory snapshot stays valid
    pub cache_hours: u32,
    /// Window used when a request has no valid `days` parameter
    pub default_days: u32,
    /// Timeout of every request sent to the server
    pub request_timeout: Duration,
    /// How long `stop` waits for the server task to settle
    pub shutdown_grace: Duration,
    /// Folder where the directory snapshot is persisted
    pub data_dir: PathBuf,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            port: 7778,
            prefix: "ifb".to_string(),
            cache_hours: 12,
            default_days: DEFAULT_WINDOW_DAYS,
            request_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(1),
            data_dir: default_data_dir(),
        }
    }
}

impl GatewaySettings {
    /// The default window, forced into the allowed range
    pub fn window_days(&self) -> u32 {
        if (1..=MAX_WINDOW_DAYS).contains(&self.default_days) {
            self.default_days
        } else {
            DEFAULT_WINDOW_DAYS
        }
    }

    /// The path prefix, without surrounding slashes
    pub fn trimmed_prefix(&self) -> &str {
        self.prefix.trim_matches('/')
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("ifb-gateway")
}
