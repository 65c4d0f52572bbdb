//! A module to extract and clean iCal data out of server responses

use minidom::Element;

use crate::utils::{find_elems, scan_tag_contents};

const CALENDAR_DATA: &str = "calendar-data";
const EOL: &str = "\r\n";


/// Returns the non-empty `calendar-data` blocks of a DAV response (usually a multistatus), in document order.
///
/// A proper XML parse is tried first. Documents that do not parse are scanned for both `<calendar-data>`
/// and `<prefix:calendar-data>` tags, because some servers send slightly broken XML.
pub fn extract_calendar_data(body: &str) -> Vec<String> {
    let mut blocks = match body.trim().parse::<Element>() {
        Ok(root) => {
            let mut elems = find_elems(&root, CALENDAR_DATA);
            if root.name() == CALENDAR_DATA {
                elems.insert(0, &root);
            }
            elems.iter().map(|el| el.text()).collect()
        },
        Err(err) => {
            log::debug!("Response is not valid XML ({}), scanning it instead", err);
            Vec::new()
        },
    };

    blocks.retain(|block: &String| block.trim().is_empty() == false);
    if blocks.is_empty() {
        blocks = scan_tag_contents(body, CALENDAR_DATA);
        blocks.retain(|block| block.trim().is_empty() == false);
    }
    blocks.into_iter().map(|block| block.trim().to_string()).collect()
}

/// The first `calendar-data` block that mentions `email`
pub fn find_calendar_data_for(body: &str, email: &str) -> Option<String> {
    let email = email.to_lowercase();
    extract_calendar_data(body)
        .into_iter()
        .find(|block| block.to_lowercase().contains(&email))
}

/// Makes a free/busy payload look like something a client can import:
/// a single `METHOD:PUBLISH` line, inside a `BEGIN:VCALENDAR`/`END:VCALENDAR` pair.
///
/// Payloads that already look like this are returned untouched.
pub fn normalize_payload(payload: &str) -> String {
    let mut changed = false;
    let mut lines: Vec<&str> = payload.lines().collect();

    while lines.first().map(|l| l.trim().is_empty()) == Some(true) {
        lines.remove(0);
        changed = true;
    }
    while lines.last().map(|l| l.trim().is_empty()) == Some(true) {
        lines.pop();
        changed = true;
    }

    let mut normalized: Vec<&str> = Vec::with_capacity(lines.len() + 4);
    let mut method_index: Option<usize> = None;
    let mut has_version = false;
    let mut in_method = false;
    for line in lines {
        let is_continuation = line.starts_with(' ') || line.starts_with('\t');
        if in_method && is_continuation {
            changed = true;
            continue;
        }
        in_method = false;

        if is_continuation == false && has_property_name(line, "METHOD") {
            in_method = true;
            if method_index.is_some() {
                changed = true;
                continue;
            }
            method_index = Some(normalized.len());
            if line != "METHOD:PUBLISH" {
                changed = true;
            }
            normalized.push("METHOD:PUBLISH");
            continue;
        }
        if is_continuation == false && has_property_name(line, "VERSION") {
            has_version = true;
        }
        normalized.push(line);
    }

    let begins = normalized.first().map(|l| l.trim().eq_ignore_ascii_case("BEGIN:VCALENDAR")) == Some(true);
    let ends = normalized.last().map(|l| l.trim().eq_ignore_ascii_case("END:VCALENDAR")) == Some(true);

    // When wrapping, a METHOD found inside the component moves up to the calendar level
    if begins == false {
        if let Some(index) = method_index.take() {
            normalized.remove(index);
        }
    }
    if method_index.is_none() {
        changed = true;
        let position = if begins { 1 } else { 0 };
        normalized.insert(position, "METHOD:PUBLISH");
    }
    if begins == false {
        changed = true;
        if has_version == false {
            normalized.insert(0, "VERSION:2.0");
        }
        normalized.insert(0, "BEGIN:VCALENDAR");
    }
    if ends == false {
        changed = true;
        normalized.push("END:VCALENDAR");
    }

    if changed == false {
        return payload.to_string();
    }
    let mut result = normalized.join(EOL);
    result.push_str(EOL);
    result
}

/// Whether an unfolded content line is the given property (`NAME:value` or `NAME;param=...:value`)
fn has_property_name(line: &str, name: &str) -> bool {
    match line.get(..name.len()) {
        Some(start) if start.eq_ignore_ascii_case(name) => {
            matches!(line[name.len()..].chars().next(), Some(':') | Some(';'))
        },
        _ => false,
    }
}
