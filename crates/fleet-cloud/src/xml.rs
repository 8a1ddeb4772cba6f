use quick_xml::{events::Event as XmlEvent, Reader as XmlReader};

/// Find the text content of the first `<tag>…</tag>` element in XML.
/// Skips over nested elements; returns `None` if not found or empty.
pub(crate) fn xml_text(xml: &str, tag: &str) -> Option<String> {
    let tag_bytes = tag.as_bytes();
    let mut reader = XmlReader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut in_tag = false;
    let mut depth: usize = 0;

    loop {
        match reader.read_event() {
            Ok(XmlEvent::Start(e)) => {
                if !in_tag && e.local_name().as_ref() == tag_bytes {
                    in_tag = true;
                    depth = 0;
                } else if in_tag {
                    depth += 1;
                }
            }
            Ok(XmlEvent::End(_)) => {
                if in_tag {
                    if depth == 0 {
                        return None;
                    }
                    depth -= 1;
                }
            }
            Ok(XmlEvent::Text(e)) if in_tag && depth == 0 => {
                return e.unescape().ok().map(|s| s.into_owned());
            }
            Ok(XmlEvent::Eof) | Err(_) => break,
            _ => {}
        }
    }
    None
}

/// Collect text content of every `<tag>…</tag>` element in XML.
pub(crate) fn xml_all_texts(xml: &str, tag: &str) -> Vec<String> {
    let tag_bytes = tag.as_bytes();
    let mut reader = XmlReader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut result = Vec::new();
    let mut depth: usize = 0;

    loop {
        match reader.read_event() {
            Ok(XmlEvent::Start(e)) => {
                if depth == 0 && e.local_name().as_ref() == tag_bytes {
                    depth = 1;
                } else if depth > 0 {
                    depth += 1;
                }
            }
            Ok(XmlEvent::End(_)) => {
                if depth > 0 {
                    depth -= 1;
                }
            }
            Ok(XmlEvent::Text(e)) if depth == 1 => {
                if let Ok(s) = e.unescape() {
                    result.push(s.into_owned());
                }
            }
            Ok(XmlEvent::Eof) | Err(_) => break,
            _ => {}
        }
    }
    result
}

/// Extract every `<tag-name>…</tag-name>` record as a flat key/value map,
/// used to pull one `<item>` out of a `*Set` list without a full schema.
pub(crate) fn xml_record(xml: &str, keys: &[&str]) -> std::collections::BTreeMap<String, String> {
    let mut out = std::collections::BTreeMap::new();
    for key in keys {
        if let Some(v) = xml_text(xml, key) {
            out.insert(key.to_string(), v);
        }
    }
    out
}

/// Extract the raw inner XML of every top-level `<tag>…</tag>` element
/// (not nested inside another occurrence of the same tag). Used to walk
/// repeated list elements (`reservationSet`, `instancesSet`, `item`, …)
/// without a full generated binding for the EC2 response schema.
pub(crate) fn xml_items(xml: &str, tag: &str) -> Vec<String> {
    let tag_bytes = tag.as_bytes();
    let mut reader = XmlReader::from_str(xml);
    reader.config_mut().trim_text(false);
    let mut items = Vec::new();
    let mut depth: usize = 0;
    let mut start_pos: usize = 0;

    loop {
        let pos_before = reader.buffer_position();
        match reader.read_event() {
            Ok(XmlEvent::Start(e)) => {
                if e.local_name().as_ref() == tag_bytes {
                    if depth == 0 {
                        start_pos = reader.buffer_position();
                    }
                    depth += 1;
                }
            }
            Ok(XmlEvent::End(e)) => {
                if e.local_name().as_ref() == tag_bytes && depth > 0 {
                    depth -= 1;
                    if depth == 0 {
                        items.push(xml[start_pos..pos_before].to_string());
                    }
                }
            }
            Ok(XmlEvent::Eof) | Err(_) => break,
            _ => {}
        }
    }
    items
}

/// First occurrence of `xml_items`, if any.
pub(crate) fn xml_block(xml: &str, tag: &str) -> Option<String> {
    xml_items(xml, tag).into_iter().next()
}

pub(crate) fn xml_error_code(xml: &str) -> String {
    xml_text(xml, "Code")
        .or_else(|| xml_text(xml, "code"))
        .unwrap_or_else(|| "Unknown".into())
}

pub(crate) fn xml_error_message(xml: &str) -> String {
    xml_text(xml, "Message")
        .or_else(|| xml_text(xml, "message"))
        .unwrap_or_else(|| "unknown error".into())
}
