//! Some utility functions

use minidom::Element;

/// Walks an XML tree and returns every element that has the given name
pub fn find_elems<S: AsRef<str>>(root: &Element, searched_name: S) -> Vec<&Element> {
    let searched_name = searched_name.as_ref();
    let mut elems: Vec<&Element> = Vec::new();

    for el in root.children() {
        if el.name() == searched_name {
            elems.push(el);
        } else {
            let ret = find_elems(el, searched_name);
            elems.extend(ret);
        }
    }
    elems
}

/// Finds the contents of every `tag_name` element of a document, whatever its namespace prefix is.
///
/// This is a plain text scan, so that it still works on documents that an XML parser would reject
/// (missing namespace declarations, stray characters...). Contents are XML-unescaped.
pub fn scan_tag_contents(document: &str, tag_name: &str) -> Vec<String> {
    // ASCII lower-casing does not move any byte, so offsets are valid in both strings
    let lower = document.to_ascii_lowercase();
    let tag_name = tag_name.to_ascii_lowercase();
    let mut blocks = Vec::new();

    let mut pos = 0;
    while let Some(found) = lower[pos..].find(&tag_name) {
        let name_start = pos + found;
        let name_end = name_start + tag_name.len();
        pos = name_end;

        let prefix = match opening_tag_prefix(&lower[..name_start]) {
            None => continue,
            Some(prefix) => prefix,
        };
        // The name must not just be the beginning of a longer name
        match lower[name_end..].chars().next() {
            Some(c) if c == '>' || c == '/' || c.is_whitespace() => {},
            _ => continue,
        }

        let open_end = match lower[name_end..].find('>') {
            None => break,
            Some(rel) => name_end + rel,
        };
        if lower[..open_end].ends_with('/') {
            // <calendar-data/>
            pos = open_end + 1;
            continue;
        }

        let closing = format!("</{}{}", prefix, tag_name);
        let content_start = open_end + 1;
        let content_end = match lower[content_start..].find(&closing) {
            None => break,
            Some(rel) => content_start + rel,
        };

        blocks.push(unescape_xml(&document[content_start..content_end]));
        pos = content_end + closing.len();
    }
    blocks
}

/// If `before` ends with `<` or `<prefix:`, returns the prefix (with its colon)
fn opening_tag_prefix(before: &str) -> Option<String> {
    let lt = before.rfind('<')?;
    let prefix = &before[lt + 1..];
    if prefix.is_empty() {
        return Some(String::new());
    }
    let name = prefix.strip_suffix(':')?;
    let is_name = name.is_empty() == false
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');
    if is_name { Some(prefix.to_string()) } else { None }
}

/// Replaces XML entities and unwraps CDATA sections
pub fn unescape_xml(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find("<![CDATA[") {
        result.push_str(&unescape_entities(&rest[..start]));
        let after = &rest[start + 9..];
        match after.find("]]>") {
            None => {
                result.push_str(after);
                return result;
            },
            Some(end) => {
                result.push_str(&after[..end]);
                rest = &after[end + 3..];
            }
        }
    }
    result.push_str(&unescape_entities(rest));
    result
}

fn unescape_entities(text: &str) -> String {
    if text.contains('&') == false {
        return text.to_string();
    }

    let mut result = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(amp) = rest.find('&') {
        result.push_str(&rest[..amp]);
        let after = &rest[amp..];
        let semicolon = match after.find(';') {
            Some(s) if s <= 10 => s,
            _ => {
                result.push('&');
                rest = &after[1..];
                continue;
            }
        };
        let entity = &after[1..semicolon];
        let decoded = match entity {
            "lt" => Some('<'),
            "gt" => Some('>'),
            "amp" => Some('&'),
            "quot" => Some('"'),
            "apos" => Some('\''),
            _ => {
                let code = if let Some(hex) = entity.strip_prefix("#x").or_else(|| entity.strip_prefix("#X")) {
                    u32::from_str_radix(hex, 16).ok()
                } else if let Some(dec) = entity.strip_prefix('#') {
                    dec.parse::<u32>().ok()
                } else {
                    None
                };
                code.and_then(char::from_u32)
            },
        };
        match decoded {
            Some(c) => {
                result.push(c);
                rest = &after[semicolon + 1..];
            },
            None => {
                result.push('&');
                rest = &after[1..];
            },
        }
    }
    result.push_str(rest);
    result
}
