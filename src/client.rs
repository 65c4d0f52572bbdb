//! This module provides a client to connect to a CalDAV/CardDAV server

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Method;
use reqwest::header::CONTENT_TYPE;
use url::Url;

use crate::config::GatewayConfiguration;
use crate::error::GatewayError;
use crate::traits::{DavResponse, Upstream};

/// Where the DAV endpoints live, relative to the server URL
const DAV_ROOT: &str = "remote.php/dav";
/// The address book that contains every user of the server
const SYSTEM_ADDRESS_BOOK: &str = "z-server-generated--system";
/// The calendar every user has by default
const PERSONAL_CALENDAR: &str = "personal";

static FREEBUSY_QUERY_BODY: &str = r#"<?xml version="1.0" encoding="utf-8" ?>
<C:free-busy-query xmlns:C="urn:ietf:params:xml:ns:caldav">
    <C:time-range start="{start}" end="{end}"/>
</C:free-busy-query>
"#;


/// A client that talks to the groupware server on behalf of the configured account
pub struct Client {
    url: Url,
    username: String,
    password: String,

    http: reqwest::Client,
}

impl Client {
    /// Create a client. This does not start a connection
    pub fn new(config: &GatewayConfiguration, timeout: Duration) -> Result<Self, GatewayError> {
        if config.is_complete() == false {
            return Err(GatewayError::ConfigurationIncomplete);
        }
        let url = Url::parse(&format!("{}/", config.base_url()))
            .map_err(|err| GatewayError::InvalidConfiguration(format!("invalid server URL {}: {}", config.base_url(), err)))?;

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| GatewayError::InvalidConfiguration(format!("unable to build HTTP client: {}", err)))?;

        Ok(Self {
            url,
            username: config.username().to_string(),
            password: config.secret().to_string(),
            http,
        })
    }

    fn dav_url(&self, path: &str) -> Result<Url, GatewayError> {
        self.url.join(&format!("{}/{}", DAV_ROOT, path))
            .map_err(|err| GatewayError::Internal(format!("unable to build URL for {}: {}", path, err)))
    }

    pub fn address_book_url(&self) -> Result<Url, GatewayError> {
        let mut url = self.dav_url(&format!("addressbooks/users/{}/{}", urlencoding::encode(&self.username), SYSTEM_ADDRESS_BOOK))?;
        url.set_query(Some("export"));
        Ok(url)
    }

    pub fn calendar_url(&self, uid: &str) -> Result<Url, GatewayError> {
        self.dav_url(&format!("calendars/{}/{}", urlencoding::encode(uid), PERSONAL_CALENDAR))
    }

    pub fn outbox_url(&self) -> Result<Url, GatewayError> {
        self.dav_url(&format!("calendars/{}/outbox/", urlencoding::encode(&self.username)))
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<DavResponse, GatewayError> {
        let response = request
            .basic_auth(self.username.clone(), Some(self.password.clone()))
            .send()
            .await
            .map_err(connectivity_error)?;

        let status = response.status().as_u16();
        let content_type = response.headers().get(CONTENT_TYPE)
            .and_then(|ct| ct.to_str().ok())
            .map(|ct| ct.to_string());
        let body = response.text().await.map_err(connectivity_error)?;
        log::debug!("Server replied HTTP {} ({} bytes, {:?})", status, body.len(), content_type);

        Ok(DavResponse { status, content_type, body })
    }
}

fn connectivity_error(err: reqwest::Error) -> GatewayError {
    if err.is_timeout() {
        GatewayError::Connectivity(format!("request timed out: {}", err))
    } else {
        GatewayError::Connectivity(err.to_string())
    }
}

fn dav_method(name: &'static str) -> Result<Method, GatewayError> {
    Method::from_bytes(name.as_bytes())
        .map_err(|err| GatewayError::Internal(format!("cannot create {} method: {}", name, err)))
}

/// Format used by CalDAV for UTC date-times
pub fn format_utc(dt: &DateTime<Utc>) -> String {
    dt.format("%Y%m%dT%H%M%SZ").to_string()
}

#[async_trait]
impl Upstream for Client {
    async fn export_address_book(&self) -> Result<DavResponse, GatewayError> {
        let url = self.address_book_url()?;
        log::info!("Downloading the address book from {}", url);
        self.send(self.http.get(url)).await
    }

    async fn free_busy_report(&self, uid: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<DavResponse, GatewayError> {
        let url = self.calendar_url(uid)?;
        let body = FREEBUSY_QUERY_BODY
            .replace("{start}", &format_utc(&start))
            .replace("{end}", &format_utc(&end));
        log::info!("Querying free/busy of {} at {}", uid, url);

        let request = self.http
            .request(dav_method("REPORT")?, url)
            .header("Depth", 1)
            .header(CONTENT_TYPE, "application/xml; charset=utf-8")
            .body(body);
        self.send(request).await
    }

    async fn post_to_outbox(&self, originator: &str, recipient: &str, itip: String) -> Result<DavResponse, GatewayError> {
        let url = self.outbox_url()?;
        log::info!("Posting a free/busy request for {} to {}", recipient, url);

        let request = self.http
            .post(url)
            .header("Depth", 0)
            .header(CONTENT_TYPE, "text/calendar; charset=utf-8")
            .header("Originator", format!("mailto:{}", originator))
            .header("Recipient", format!("mailto:{}", recipient))
            .body(itip);
        self.send(request).await
    }
}
