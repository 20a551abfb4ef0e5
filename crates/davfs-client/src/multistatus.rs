//! PROPFIND `207 Multi-Status` body parsing.

use chrono::DateTime;
use std::time::SystemTime;
use xmlparser::{ElementEnd, Token, Tokenizer};

use crate::error::{Result, StoreError};
use crate::store::{Metadata, COLLECTION};

/// Request body asking for the properties the filesystem needs.
pub const PROPFIND_BODY: &str = concat!(
    "<?xml version=\"1.0\" encoding=\"utf-8\"?>",
    "<D:propfind xmlns:D=\"DAV:\"><D:prop>",
    "<D:resourcetype/><D:getcontentlength/><D:getlastmodified/><D:creationdate/>",
    "</D:prop></D:propfind>"
);

/// One `<response>` element, before it is turned into [`Metadata`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PropEntry {
    /// Decoded href path.
    pub href: String,
    pub collection: bool,
    pub content_length: Option<u64>,
    pub last_modified: Option<String>,
    pub creation_date: Option<String>,
}

impl PropEntry {
    pub fn into_metadata(self, name: &str) -> Metadata {
        let mtime = self
            .last_modified
            .as_deref()
            .and_then(parse_http_date)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let ctime = self
            .creation_date
            .as_deref()
            .and_then(parse_http_date)
            .unwrap_or(mtime);
        Metadata {
            name: name.to_string(),
            is_dir: self.collection,
            size: if self.collection {
                0
            } else {
                self.content_length.unwrap_or(0)
            },
            mtime,
            ctime,
            resource_type: if self.collection {
                COLLECTION.to_string()
            } else {
                String::new()
            },
        }
    }
}

/// Parses RFC 1123 (`getlastmodified`) or RFC 3339 (`creationdate`) stamps.
pub fn parse_http_date(value: &str) -> Option<SystemTime> {
    let value = value.trim();
    DateTime::parse_from_rfc2822(value)
        .or_else(|_| DateTime::parse_from_rfc3339(value))
        .ok()
        .map(SystemTime::from)
}

fn unescape(text: &str) -> String {
    if !text.contains('&') {
        return text.to_string();
    }
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

fn decode_href(raw: &str) -> String {
    let raw = raw.trim();
    let path = match raw.find("://") {
        Some(scheme_end) => {
            let rest = &raw[scheme_end + 3..];
            match rest.find('/') {
                Some(idx) => &rest[idx..],
                None => "/",
            }
        }
        None => raw,
    };
    urlencoding::decode(path)
        .map(|p| p.into_owned())
        .unwrap_or_else(|_| path.to_string())
}

/// Parse a multistatus document into its `<response>` entries.
pub fn parse_multistatus(body: &str) -> Result<Vec<PropEntry>> {
    let mut entries = Vec::new();
    let mut stack: Vec<String> = Vec::new();
    let mut current: Option<PropEntry> = None;

    for token in Tokenizer::from(body) {
        let token = token.map_err(|e| StoreError::Protocol {
            reason: format!("malformed multistatus: {}", e),
        })?;
        match token {
            Token::ElementStart { local, .. } => {
                let local = local.as_str();
                if local == "response" {
                    current = Some(PropEntry::default());
                }
                if local == "collection" && stack.iter().any(|s| s == "resourcetype") {
                    if let Some(entry) = current.as_mut() {
                        entry.collection = true;
                    }
                }
                stack.push(local.to_string());
            }
            Token::ElementEnd { end, .. } => match end {
                ElementEnd::Open => {}
                ElementEnd::Empty | ElementEnd::Close(..) => {
                    if stack.pop().as_deref() == Some("response") {
                        if let Some(entry) = current.take() {
                            entries.push(entry);
                        }
                    }
                }
            },
            Token::Text { text } => {
                let (Some(entry), Some(top)) = (current.as_mut(), stack.last()) else {
                    continue;
                };
                let value = unescape(text.as_str());
                if value.trim().is_empty() {
                    continue;
                }
                match top.as_str() {
                    "href" => entry.href.push_str(&decode_href(&value)),
                    "getcontentlength" => entry.content_length = value.trim().parse().ok(),
                    "getlastmodified" => entry.last_modified = Some(value),
                    "creationdate" => entry.creation_date = Some(value),
                    _ => {}
                }
            }
            _ => {}
        }
    }

    if !stack.is_empty() {
        return Err(StoreError::Protocol {
            reason: "unterminated multistatus document".to_string(),
        });
    }
    Ok(entries)
}
