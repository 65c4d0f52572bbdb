//! Turns client requests into free/busy lookups, and lookup results into HTTP responses

use std::any::Any;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use tower_http::catch_panic::CatchPanicLayer;

use crate::cache::AddressBook;
use crate::config::MAX_WINDOW_DAYS;
use crate::error::GatewayError;
use crate::resolver::{FreeBusyOutcome, FreeBusyQuery, FreeBusyResolver};

/// Why a request path was rejected
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouteError {
    NotSupported,
    MissingIdentifier,
    InvalidIdentifier,
}

/// What is sent back to the client
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reply {
    Calendar(String),
    NoContent,
    Error { status: u16, message: String },
}

impl Reply {
    fn error<S: ToString>(status: u16, message: S) -> Self {
        Self::Error { status, message: message.to_string() }
    }

    pub fn status(&self) -> u16 {
        match self {
            Self::Calendar(_) => 200,
            Self::NoContent => 204,
            Self::Error { status, .. } => *status,
        }
    }
}

impl From<GatewayError> for Reply {
    fn from(err: GatewayError) -> Self {
        Self::Error { status: err.http_status(), message: err.client_message() }
    }
}

impl IntoResponse for Reply {
    fn into_response(self) -> Response {
        match self {
            Self::Calendar(payload) => (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "text/calendar; charset=utf-8")],
                payload,
            ).into_response(),
            Self::NoContent => StatusCode::NO_CONTENT.into_response(),
            Self::Error { status, message } => (
                StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
                [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
                message,
            ).into_response(),
        }
    }
}


/// Everything a request needs, shared by all the connections of a running gateway
pub struct RequestContext {
    address_book: Arc<AddressBook>,
    resolver: FreeBusyResolver,
    prefix: String,
    default_days: u32,
}

impl RequestContext {
    pub fn new(address_book: Arc<AddressBook>, resolver: FreeBusyResolver, prefix: &str, default_days: u32) -> Self {
        Self {
            address_book,
            resolver,
            prefix: prefix.trim_matches('/').to_string(),
            default_days,
        }
    }

    pub async fn respond(&self, method: &Method, uri: &Uri) -> Reply {
        if *method != Method::GET {
            return Reply::error(405, "method not allowed");
        }

        let identifier = match parse_freebusy_path(uri.path(), &self.prefix) {
            Err(RouteError::NotSupported) => return Reply::error(404, "path not supported"),
            Err(RouteError::MissingIdentifier) => return Reply::error(400, "missing identifier"),
            Err(RouteError::InvalidIdentifier) => return Reply::error(400, "invalid identifier"),
            Ok(identifier) => identifier,
        };
        let days = parse_days(uri.query(), self.default_days);

        match self.free_busy(&identifier, days).await {
            Ok(reply) => reply,
            Err(err) => {
                log::warn!("Free/busy lookup for {} failed: {}", identifier, err);
                Reply::from(err)
            },
        }
    }

    async fn free_busy(&self, identifier: &str, days: u32) -> Result<Reply, GatewayError> {
        let email = match self.address_book.resolve_identifier(identifier).await? {
            None => return Ok(Reply::error(404, "user not found")),
            Some(email) => email,
        };
        let uid = match self.address_book.uid_for_email(&email).await? {
            None => return Ok(Reply::error(404, "user not found")),
            Some(uid) => uid,
        };

        let outcome = self.resolver.resolve(&FreeBusyQuery { uid, email, days }).await?;
        Ok(match outcome {
            FreeBusyOutcome::Payload(payload) if payload.trim().is_empty() == false => Reply::Calendar(payload),
            _ => Reply::NoContent,
        })
    }
}

/// Extracts the lower-cased identifier of a `/<prefix>/freebusy/<identifier>.vfb` path
pub fn parse_freebusy_path(path: &str, prefix: &str) -> Result<String, RouteError> {
    let expected = match prefix.trim_matches('/') {
        "" => "/freebusy/".to_string(),
        prefix => format!("/{}/freebusy/", prefix),
    };

    match path.get(..expected.len()) {
        Some(start) if start.eq_ignore_ascii_case(&expected) => {},
        _ => return Err(RouteError::NotSupported),
    }
    let rest = &path[expected.len()..];

    let segment = match rest.len().checked_sub(4).and_then(|cut| Some((rest.get(..cut)?, rest.get(cut..)?))) {
        Some((segment, extension)) if extension.eq_ignore_ascii_case(".vfb") => segment,
        _ => return Err(RouteError::NotSupported),
    };
    if segment.contains('/') {
        return Err(RouteError::NotSupported);
    }

    let decoded = urlencoding::decode(segment).map_err(|_| RouteError::InvalidIdentifier)?;
    let identifier = decoded.trim().to_lowercase();
    if identifier.is_empty() {
        return Err(RouteError::MissingIdentifier);
    }
    Ok(identifier)
}

/// The `days` parameter of a query string, or `default_days` if it is missing, invalid or out of range
pub fn parse_days(query: Option<&str>, default_days: u32) -> u32 {
    let value = query.and_then(|query| {
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(key, _)| key.eq_ignore_ascii_case("days"))
            .map(|(_, value)| value.into_owned())
    });

    match value.and_then(|v| v.trim().parse::<u32>().ok()) {
        Some(days) if (1..=MAX_WINDOW_DAYS).contains(&days) => days,
        _ => default_days,
    }
}


pub fn router(context: Arc<RequestContext>) -> Router {
    Router::new()
        .fallback(handle_request)
        .with_state(context)
        .layer(CatchPanicLayer::custom(panic_response))
}

async fn handle_request(State(context): State<Arc<RequestContext>>, method: Method, uri: Uri) -> Response {
    log::info!("Start {} {}", method, uri);
    let reply = context.respond(&method, &uri).await;
    log::info!("End {} {}: HTTP {}", method, uri.path(), reply.status());
    reply.into_response()
}

fn panic_response(err: Box<dyn Any + Send + 'static>) -> Response {
    let details = if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "unknown error".to_string()
    };
    log::error!("A request handler panicked: {}", details);
    Reply::error(500, "internal error").into_response()
}
