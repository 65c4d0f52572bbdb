use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::GatewayError;

/// What a DAV server answered, once an HTTP status has been obtained
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DavResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: String,
}

impl DavResponse {
    pub fn new<S: ToString>(status: u16, content_type: Option<&str>, body: S) -> Self {
        Self {
            status,
            content_type: content_type.map(|ct| ct.to_string()),
            body: body.to_string(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Whether the server declared this body as iCalendar data
    pub fn is_calendar(&self) -> bool {
        match &self.content_type {
            None => false,
            Some(ct) => ct.to_ascii_lowercase().starts_with("text/calendar"),
        }
    }

    /// Turns a non-success response into an error
    pub fn into_error(self) -> GatewayError {
        let message = match self.body.trim() {
            "" => format!("Unexpected HTTP status code {}", self.status),
            body => body.chars().take(200).collect(),
        };
        GatewayError::Upstream { status: self.status, message }
    }
}

/// The calls the gateway makes to the groupware server.
///
/// Every call returns `Err(GatewayError::Connectivity)` when no HTTP status could be obtained, and
/// `Ok` otherwise, whatever the status is.
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Downloads the vCard export of the system address book
    async fn export_address_book(&self) -> Result<DavResponse, GatewayError>;

    /// Sends a CalDAV free-busy-query REPORT to the personal calendar of `uid`
    async fn free_busy_report(&self, uid: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<DavResponse, GatewayError>;

    /// POSTs an iTIP message to our own scheduling outbox
    async fn post_to_outbox(&self, originator: &str, recipient: &str, itip: String) -> Result<DavResponse, GatewayError>;
}
