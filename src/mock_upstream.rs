//! This module provides a scripted server, so that tests can check which requests the gateway sends
#![cfg(test)]

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::GatewayError;
use crate::traits::{DavResponse, Upstream};

/// A request that has been received by a [`MockUpstream`]
#[derive(Clone, Debug, PartialEq)]
pub enum UpstreamCall {
    Export,
    Report { uid: String, start: DateTime<Utc>, end: DateTime<Utc> },
    Outbox { originator: String, recipient: String, itip: String },
}

/// Replies the same thing to every request of a given kind, and records them
pub struct MockUpstream {
    pub directory: Result<DavResponse, GatewayError>,
    pub report: Result<DavResponse, GatewayError>,
    pub outbox: Result<DavResponse, GatewayError>,
    /// Makes the directory download slow, to test concurrent callers
    pub export_delay: Option<Duration>,

    calls: Mutex<Vec<UpstreamCall>>,
}

impl MockUpstream {
    /// A server that serves this vCard export, and nothing else
    pub fn with_directory(vcards: &str) -> Self {
        Self {
            directory: Ok(DavResponse::new(200, Some("text/vcard; charset=utf-8"), vcards)),
            report: Ok(DavResponse::new(404, None, "")),
            outbox: Ok(DavResponse::new(404, None, "")),
            export_delay: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<UpstreamCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn export_count(&self) -> usize {
        self.calls().iter().filter(|call| matches!(call, UpstreamCall::Export)).count()
    }

    pub fn report_calls(&self) -> Vec<UpstreamCall> {
        self.calls().into_iter().filter(|call| matches!(call, UpstreamCall::Report{..})).collect()
    }

    pub fn outbox_calls(&self) -> Vec<UpstreamCall> {
        self.calls().into_iter().filter(|call| matches!(call, UpstreamCall::Outbox{..})).collect()
    }

    fn record(&self, call: UpstreamCall) {
        log::debug!("Mock upstream received {:?}", call);
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl Upstream for MockUpstream {
    async fn export_address_book(&self) -> Result<DavResponse, GatewayError> {
        self.record(UpstreamCall::Export);
        if let Some(delay) = self.export_delay {
            tokio::time::sleep(delay).await;
        }
        self.directory.clone()
    }

    async fn free_busy_report(&self, uid: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<DavResponse, GatewayError> {
        self.record(UpstreamCall::Report { uid: uid.to_string(), start, end });
        self.report.clone()
    }

    async fn post_to_outbox(&self, originator: &str, recipient: &str, itip: String) -> Result<DavResponse, GatewayError> {
        self.record(UpstreamCall::Outbox { originator: originator.to_string(), recipient: recipient.to_string(), itip });
        self.outbox.clone()
    }
}
