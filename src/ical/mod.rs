//! This module handles iCal data exchanged with the server
//!
//! Requests are built with the `ics` crate, while responses are only scanned and cleaned up, because
//! the gateway forwards them to the client rather than interpreting them.

mod parser;
pub use parser::{extract_calendar_data, find_calendar_data_for, normalize_payload};
mod builder;
pub use builder::{build_freebusy_request, Party};

use crate::config::{ORG_NAME, PRODUCT_NAME};

pub fn default_prod_id() -> String {
    let org_name = ORG_NAME.lock().map(|name| name.clone()).unwrap_or_default();
    let product_name = PRODUCT_NAME.lock().map(|name| name.clone()).unwrap_or_default();
    format!("-//{}//{}//EN", org_name, product_name)
}
