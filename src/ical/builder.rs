//! A module to build the iTIP free/busy requests sent to a scheduling outbox

use chrono::{DateTime, Utc};
use ics::parameters::CN;
use ics::properties::{Attendee, DtEnd, DtStart, Method, Organizer};
use ics::{FreeBusy, ICalendar};

use crate::client::format_utc;
use crate::ical::default_prod_id;

/// Someone that takes part in a free/busy request
pub struct Party<'a> {
    pub email: &'a str,
    pub display_name: Option<&'a str>,
}

/// Create a `METHOD:REQUEST` VFREEBUSY, from `organizer` (us) about `attendee`, over the given window
pub fn build_freebusy_request(organizer: &Party, attendee: &Party, start: DateTime<Utc>, end: DateTime<Utc>) -> String {
    build_freebusy_request_with_uid(organizer, attendee, start, end, &uuid::Uuid::new_v4().to_string(), Utc::now())
}

fn build_freebusy_request_with_uid(organizer: &Party, attendee: &Party, start: DateTime<Utc>, end: DateTime<Utc>, uid: &str, now: DateTime<Utc>) -> String {
    let mut freebusy = FreeBusy::new(uid.to_string(), format_utc(&now));
    freebusy.push(DtStart::new(format_utc(&start)));
    freebusy.push(DtEnd::new(format_utc(&end)));

    let mut organizer_prop = Organizer::new(format!("mailto:{}", organizer.email));
    if let Some(name) = organizer.display_name {
        organizer_prop.add(CN::new(quote_param_value(name)));
    }
    freebusy.push(organizer_prop);

    let mut attendee_prop = Attendee::new(format!("mailto:{}", attendee.email));
    if let Some(name) = attendee.display_name {
        attendee_prop.add(CN::new(quote_param_value(name)));
    }
    freebusy.push(attendee_prop);

    let mut calendar = ICalendar::new("2.0", default_prod_id());
    calendar.push(Method::new("REQUEST"));
    calendar.add_freebusy(freebusy);

    calendar.to_string()
}

/// Makes a display name usable as a parameter value.
///
/// Values that contain `:`, `;` or `,` must be quoted, and double quotes cannot be escaped at all.
pub fn quote_param_value(value: &str) -> String {
    let cleaned: String = value
        .chars()
        .filter(|c| c.is_control() == false)
        .map(|c| if c == '"' { '\'' } else { c })
        .collect();

    if cleaned.contains(|c| c == ':' || c == ';' || c == ',') {
        format!("\"{}\"", cleaned)
    } else {
        cleaned
    }
}
