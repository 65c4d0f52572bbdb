//! A module to parse the vCard export of the server address book

use ical::parser::vcard::component::VcardContact;

/// A principal of the server directory
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub uid: String,
    /// Lower-cased addresses, in the order of the vCard. The first one is the canonical one
    pub emails: Vec<String>,
    pub display_name: Option<String>,
}

/// Parse a vCard stream into directory entries.
///
/// Cards that cannot be parsed, or that have no UID or no email, are skipped.
pub fn parse_directory(content: &str) -> Vec<DirectoryEntry> {
    let content = content.replace("\r\n", "\n");
    let reader = ical::VcardParser::new(content.as_bytes());

    let mut entries = Vec::new();
    for card in reader {
        match card {
            Err(err) => {
                log::warn!("Ignoring an invalid vCard: {}", err);
            },
            Ok(card) => {
                if let Some(entry) = entry_from_card(&card) {
                    entries.push(entry);
                }
            },
        }
    }
    log::debug!("Parsed {} directory entries", entries.len());
    entries
}

fn entry_from_card(card: &VcardContact) -> Option<DirectoryEntry> {
    let mut uid = None;
    let mut display_name = None;
    let mut emails: Vec<String> = Vec::new();

    for prop in &card.properties {
        let value = match prop.value.as_deref().map(str::trim) {
            None | Some("") => continue,
            Some(v) => v,
        };

        if prop.name.eq_ignore_ascii_case("UID") {
            if uid.is_none() {
                uid = Some(value.to_string());
            }
        } else if prop.name.eq_ignore_ascii_case("FN") {
            if display_name.is_none() {
                display_name = Some(value.to_string());
            }
        } else if prop.name.eq_ignore_ascii_case("EMAIL") {
            let email = normalize_email(value);
            if email.contains('@') && emails.contains(&email) == false {
                emails.push(email);
            }
        }
    }

    let uid = match uid {
        None => {
            log::debug!("Skipping a vCard without UID ({:?})", display_name);
            return None;
        },
        Some(uid) => uid,
    };
    if emails.is_empty() {
        log::debug!("Skipping {}, that has no email address", uid);
        return None;
    }

    Some(DirectoryEntry { uid, emails, display_name })
}

/// Lower-cases an address, and strips a `mailto:` prefix some servers add
pub fn normalize_email(raw: &str) -> String {
    let trimmed = raw.trim();
    let without_scheme = match trimmed.get(..7) {
        Some(scheme) if scheme.eq_ignore_ascii_case("mailto:") => &trimmed[7..],
        _ => trimmed,
    };
    without_scheme.trim().to_lowercase()
}
