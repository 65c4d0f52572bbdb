//! This module produces free/busy data for a directory principal
//!
//! The server is first asked directly, with a CalDAV free-busy-query on the personal calendar of the
//! principal. Servers often forbid this for other users' calendars, in which case the gateway falls
//! back to an iTIP request sent through our own scheduling outbox.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::cache::AddressBook;
use crate::error::GatewayError;
use crate::ical::{build_freebusy_request, extract_calendar_data, find_calendar_data_for, normalize_payload, Party};
use crate::traits::{DavResponse, Upstream};

/// Who to get free/busy data of, and for how long
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FreeBusyQuery {
    pub uid: String,
    pub email: String,
    pub days: u32,
}

/// A successful resolution
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FreeBusyOutcome {
    /// iCal data, ready to be sent to the client
    Payload(String),
    /// The server did not provide anything
    NoData,
}

/// What the direct query told us
enum DirectResult {
    Found(String),
    /// Nothing usable, but worth trying the scheduling outbox
    Fallback(String),
}


pub struct FreeBusyResolver {
    upstream: Arc<dyn Upstream>,
    address_book: Arc<AddressBook>,
}

impl FreeBusyResolver {
    pub fn new(upstream: Arc<dyn Upstream>, address_book: Arc<AddressBook>) -> Self {
        Self { upstream, address_book }
    }

    pub async fn resolve(&self, query: &FreeBusyQuery) -> Result<FreeBusyOutcome, GatewayError> {
        let start = Utc::now();
        let end = start + Duration::days(i64::from(query.days));

        match self.query_directly(query, start, end).await? {
            DirectResult::Found(payload) => {
                log::info!("Got free/busy data of {} from its calendar", query.email);
                Ok(FreeBusyOutcome::Payload(payload))
            },
            DirectResult::Fallback(reason) => {
                log::info!("Direct free/busy query for {} failed ({}), trying the scheduling outbox", query.email, reason);
                self.query_outbox(query, start, end).await
            },
        }
    }

    async fn query_directly(&self, query: &FreeBusyQuery, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<DirectResult, GatewayError> {
        let response = match self.upstream.free_busy_report(&query.uid, start, end).await {
            Ok(response) => response,
            Err(err) if err.is_fallback_eligible() => return Ok(DirectResult::Fallback(err.to_string())),
            Err(err) => return Err(err),
        };

        if response.is_success() == false {
            let err = response.into_error();
            if err.is_fallback_eligible() {
                return Ok(DirectResult::Fallback(err.to_string()));
            }
            log::warn!("Direct free/busy query for {} failed: {}", query.email, err);
            return Err(err);
        }

        Ok(match direct_payload(&response) {
            Some(payload) => DirectResult::Found(payload),
            None => DirectResult::Fallback(format!("HTTP {} without calendar data", response.status)),
        })
    }

    async fn query_outbox(&self, query: &FreeBusyQuery, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<FreeBusyOutcome, GatewayError> {
        let own_email = match self.address_book.own_email().await? {
            None => return Err(GatewayError::Precondition("own account not found".to_string())),
            Some(email) => email,
        };
        let own_uid = self.address_book.uid_for_email(&own_email).await?;
        let own_name = match &own_uid {
            None => None,
            Some(uid) => self.address_book.display_name_for_uid(uid).await?,
        };
        let target_name = self.address_book.display_name_for_uid(&query.uid).await?;

        let itip = build_freebusy_request(
            &Party { email: &own_email, display_name: own_name.as_deref() },
            &Party { email: &query.email, display_name: target_name.as_deref() },
            start, end,
        );

        let response = self.upstream.post_to_outbox(&own_email, &query.email, itip).await?;
        if response.is_success() == false {
            let err = response.into_error();
            log::warn!("Scheduling request for {} failed: {}", query.email, err);
            return Err(err);
        }

        match find_calendar_data_for(&response.body, &query.email) {
            Some(payload) => {
                log::info!("Got free/busy data of {} from the scheduling outbox", query.email);
                Ok(FreeBusyOutcome::Payload(normalize_payload(&payload)))
            },
            None => {
                log::info!("The scheduling outbox has no free/busy data about {}", query.email);
                Ok(FreeBusyOutcome::NoData)
            },
        }
    }
}

/// The iCal data of a successful direct query, as is
fn direct_payload(response: &DavResponse) -> Option<String> {
    if response.body.trim().is_empty() {
        return None;
    }
    if response.is_calendar() {
        return Some(response.body.clone());
    }
    extract_calendar_data(&response.body).into_iter().next()
}


#[cfg(test)]
mod tests {
    use super::*;

    use crate::config::{GatewayConfiguration, GatewaySettings};
    use crate::mock_upstream::{MockUpstream, UpstreamCall};

    const DIRECTORY: &str = "BEGIN:VCARD
VERSION:3.0
UID:john
FN:John Doe
EMAIL:john@example.com
END:VCARD
BEGIN:VCARD
VERSION:3.0
UID:alice
FN:Alice Wonder
EMAIL:alice@example.com
END:VCARD
";

    const FREEBUSY: &str = "BEGIN:VCALENDAR\r\nVERSION:2.0\r\nBEGIN:VFREEBUSY\r\nFREEBUSY:20210322T090000Z/20210322T100000Z\r\nEND:VFREEBUSY\r\nEND:VCALENDAR\r\n";

    const SCHEDULE_RESPONSE: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<cal:schedule-response xmlns:d="DAV:" xmlns:cal="urn:ietf:params:xml:ns:caldav">
  <cal:response>
    <cal:recipient><d:href>mailto:alice@example.com</d:href></cal:recipient>
    <cal:request-status>2.0;Success</cal:request-status>
    <cal:calendar-data>BEGIN:VCALENDAR
VERSION:2.0
METHOD:REPLY
BEGIN:VFREEBUSY
ATTENDEE:mailto:alice@example.com
END:VFREEBUSY
END:VCALENDAR</cal:calendar-data>
  </cal:response>
</cal:schedule-response>"#;

    struct Setup {
        upstream: Arc<MockUpstream>,
        resolver: FreeBusyResolver,
        _dir: tempfile::TempDir,
    }

    fn setup(upstream: MockUpstream, username: &str) -> Setup {
        let _ = env_logger::builder().is_test(true).try_init();
        let dir = tempfile::tempdir().unwrap();
        let upstream = Arc::new(upstream);
        let config = GatewayConfiguration::new("https://cloud.example.com", username, "secret");
        let settings = GatewaySettings { data_dir: dir.path().to_path_buf(), ..GatewaySettings::default() };
        let address_book = Arc::new(AddressBook::new(upstream.clone(), &config, &settings));
        let resolver = FreeBusyResolver::new(upstream.clone(), address_book);
        Setup { upstream, resolver, _dir: dir }
    }

    fn query(days: u32) -> FreeBusyQuery {
        FreeBusyQuery { uid: "alice".to_string(), email: "alice@example.com".to_string(), days }
    }

    fn with_report(report: Result<DavResponse, GatewayError>) -> MockUpstream {
        let mut upstream = MockUpstream::with_directory(DIRECTORY);
        upstream.report = report;
        upstream.outbox = Ok(DavResponse::new(200, Some("application/xml"), SCHEDULE_RESPONSE));
        upstream
    }

    #[tokio::test]
    async fn direct_calendar_is_returned_as_is() {
        let s = setup(with_report(Ok(DavResponse::new(200, Some("text/calendar; charset=utf-8"), FREEBUSY))), "john");

        let outcome = s.resolver.resolve(&query(30)).await.unwrap();
        assert_eq!(outcome, FreeBusyOutcome::Payload(FREEBUSY.to_string()));
        assert!(s.upstream.outbox_calls().is_empty());

        match &s.upstream.report_calls()[0] {
            UpstreamCall::Report { uid, start, end } => {
                assert_eq!(uid, "alice");
                assert_eq!(*end - *start, Duration::days(30));
            },
            other => panic!("unexpected call {:?}", other),
        }
    }

    #[tokio::test]
    async fn direct_multistatus_is_extracted() {
        let freebusy = FREEBUSY.replace("\r\n", "\n");
        let body = format!("<d:multistatus xmlns:d=\"DAV:\" xmlns:c=\"urn:ietf:params:xml:ns:caldav\"><d:response><d:propstat><d:prop><c:calendar-data>{}</c:calendar-data></d:prop></d:propstat></d:response></d:multistatus>", freebusy);
        let s = setup(with_report(Ok(DavResponse::new(207, Some("application/xml"), body))), "john");

        let outcome = s.resolver.resolve(&query(7)).await.unwrap();
        assert_eq!(outcome, FreeBusyOutcome::Payload(freebusy.trim().to_string()));
        assert!(s.upstream.outbox_calls().is_empty());
    }

    #[tokio::test]
    async fn eligible_statuses_fall_back() {
        for status in [401, 403, 404, 405, 501] {
            let s = setup(with_report(Ok(DavResponse::new(status, None, "nope"))), "john");

            let outcome = s.resolver.resolve(&query(30)).await.unwrap();
            match outcome {
                FreeBusyOutcome::Payload(payload) => {
                    assert!(payload.contains("METHOD:PUBLISH"));
                    assert_eq!(payload.contains("METHOD:REPLY"), false);
                },
                other => panic!("HTTP {} gave {:?}", status, other),
            }
            assert_eq!(s.upstream.outbox_calls().len(), 1, "HTTP {} should fall back", status);
        }
    }

    #[tokio::test]
    async fn server_errors_do_not_fall_back() {
        let s = setup(with_report(Ok(DavResponse::new(500, None, "Internal Server Error"))), "john");

        let err = s.resolver.resolve(&query(30)).await.unwrap_err();
        assert_eq!(err.http_status(), 500);
        assert_eq!(err.client_message(), "Internal Server Error");
        assert!(s.upstream.outbox_calls().is_empty());
    }

    #[tokio::test]
    async fn empty_direct_answer_falls_back() {
        let s = setup(with_report(Ok(DavResponse::new(200, Some("text/calendar"), ""))), "john");

        let outcome = s.resolver.resolve(&query(30)).await.unwrap();
        assert!(matches!(outcome, FreeBusyOutcome::Payload(_)));
        assert_eq!(s.upstream.outbox_calls().len(), 1);

        // Unrecognized content is not an error either
        let s = setup(with_report(Ok(DavResponse::new(200, Some("text/html"), "<html>hello</html>"))), "john");
        s.resolver.resolve(&query(30)).await.unwrap();
        assert_eq!(s.upstream.outbox_calls().len(), 1);
    }

    #[tokio::test]
    async fn unreachable_calendar_falls_back() {
        let s = setup(with_report(Err(GatewayError::Connectivity("timed out".into()))), "john");
        s.resolver.resolve(&query(30)).await.unwrap();
        assert_eq!(s.upstream.outbox_calls().len(), 1);
    }

    #[tokio::test]
    async fn outbox_request_content() {
        let s = setup(with_report(Ok(DavResponse::new(403, None, ""))), "john");
        s.resolver.resolve(&query(9)).await.unwrap();

        let report_window = match &s.upstream.report_calls()[0] {
            UpstreamCall::Report { start, end, .. } => (*start, *end),
            other => panic!("unexpected call {:?}", other),
        };
        match &s.upstream.outbox_calls()[0] {
            UpstreamCall::Outbox { originator, recipient, itip } => {
                assert_eq!(originator, "john@example.com");
                assert_eq!(recipient, "alice@example.com");
                assert!(itip.contains("METHOD:REQUEST"));
                assert!(itip.contains("ORGANIZER;CN=John Doe:mailto:john@example.com"));
                assert!(itip.contains("ATTENDEE;CN=Alice Wonder:mailto:alice@example.com"));
                // Both queries cover the same window
                assert!(itip.contains(&format!("DTSTART:{}", crate::client::format_utc(&report_window.0))));
                assert!(itip.contains(&format!("DTEND:{}", crate::client::format_utc(&report_window.1))));
            },
            other => panic!("unexpected call {:?}", other),
        }
    }

    #[tokio::test]
    async fn outbox_without_data_about_target() {
        let mut upstream = with_report(Ok(DavResponse::new(404, None, "")));
        upstream.outbox = Ok(DavResponse::new(200, Some("application/xml"), SCHEDULE_RESPONSE.replace("alice@example.com", "someone@example.com")));
        let s = setup(upstream, "john");

        assert_eq!(s.resolver.resolve(&query(30)).await.unwrap(), FreeBusyOutcome::NoData);
    }

    #[tokio::test]
    async fn outbox_errors() {
        let mut upstream = with_report(Ok(DavResponse::new(404, None, "")));
        upstream.outbox = Err(GatewayError::Connectivity("connection reset".into()));
        let s = setup(upstream, "john");
        assert!(matches!(s.resolver.resolve(&query(30)).await, Err(GatewayError::Connectivity(_))));

        let mut upstream = with_report(Ok(DavResponse::new(404, None, "")));
        upstream.outbox = Ok(DavResponse::new(403, None, "Forbidden"));
        let s = setup(upstream, "john");
        assert_eq!(s.resolver.resolve(&query(30)).await.unwrap_err().http_status(), 403);
    }

    #[tokio::test]
    async fn unknown_own_account() {
        let s = setup(with_report(Ok(DavResponse::new(404, None, ""))), "stranger");

        let err = s.resolver.resolve(&query(30)).await.unwrap_err();
        assert_eq!(err.http_status(), 412);
        assert_eq!(err.client_message(), "own account not found");
        assert!(s.upstream.outbox_calls().is_empty());
    }
}
