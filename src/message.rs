use std::collections::HashSet;

use chrono::{DateTime, Utc};
use mail_parser::{Addr, HeaderValue};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const NO_SUBJECT: &str = "(no subject)";
pub const UNKNOWN_SENDER: &str = "unknown sender";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("message {0} has an empty body")]
    Empty(u32),

    #[error("message {0} is not a valid MIME message")]
    Malformed(u32),
}

/// A message as it came off the wire. Only lives until it is parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFetchedMessage {
    pub sequence_id: u32,
    pub mime_source: Vec<u8>,
    pub flags: HashSet<String>,
}

/// A parsed message as returned to callers.
///
/// `id` is the server UID and is only meaningful within the mailbox session
/// that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedMessage {
    pub id: u32,
    pub subject: String,
    pub from_display: String,
    pub to_display: String,
    /// Date header, or the fetch time when the header is missing.
    pub date: DateTime<Utc>,
    /// Whether `date` came from the message itself.
    pub dated: bool,
    pub plain_text: String,
    pub html: String,
    pub flags: Vec<String>,
    pub received_at: DateTime<Utc>,
}

impl NormalizedMessage {
    /// Unix timestamp used for recency ordering. Undated messages sort as the epoch.
    pub fn sort_timestamp(&self) -> i64 {
        if self.dated {
            self.date.timestamp()
        } else {
            0
        }
    }

    pub fn is_addressed_to(&self, alias: &str) -> bool {
        self.to_display.to_lowercase().contains(&alias.to_lowercase())
    }
}

pub fn parse(raw: &RawFetchedMessage, fetched_at: DateTime<Utc>) -> Result<NormalizedMessage, ParseError> {
    if raw.mime_source.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(ParseError::Empty(raw.sequence_id));
    }

    let parsed = mail_parser::Message::parse(&raw.mime_source)
        .filter(|m| !m.headers().is_empty())
        .ok_or(ParseError::Malformed(raw.sequence_id))?;

    let subject = parsed
        .subject()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .unwrap_or(NO_SUBJECT)
        .to_string();

    let from_display = address_display(parsed.from()).unwrap_or_else(|| UNKNOWN_SENDER.to_string());
    let to_display = address_display(parsed.to()).unwrap_or_default();

    let header_date = parsed
        .date()
        .and_then(|d| DateTime::from_timestamp(d.to_timestamp(), 0));

    let plain_text = parsed
        .body_text(0)
        .map(|t| t.to_string())
        .unwrap_or_default();

    // mail-parser renders a text/plain part as HTML when there is no HTML part
    let html = parsed
        .body_html(0)
        .map(|h| h.to_string())
        .unwrap_or_default();

    let mut flags: Vec<String> = raw.flags.iter().cloned().collect();
    flags.sort();

    Ok(NormalizedMessage {
        id: raw.sequence_id,
        subject,
        from_display,
        to_display,
        date: header_date.unwrap_or(fetched_at),
        dated: header_date.is_some(),
        plain_text,
        html,
        flags,
        received_at: fetched_at,
    })
}

/// Parse a fetched batch. Messages that cannot be parsed are logged and skipped.
pub fn parse_batch(raw: &[RawFetchedMessage], fetched_at: DateTime<Utc>) -> Vec<NormalizedMessage> {
    let mut messages = Vec::with_capacity(raw.len());

    for message in raw {
        match parse(message, fetched_at) {
            Ok(parsed) => messages.push(parsed),
            Err(e) => log::warn!("Skipping unparseable message: {}", e),
        }
    }

    log::debug!("Parsed {} of {} fetched messages", messages.len(), raw.len());
    messages
}

fn format_addr(addr: &Addr) -> Option<String> {
    let name = addr.name.as_deref().map(str::trim).filter(|n| !n.is_empty());
    let address = addr.address.as_deref().map(str::trim).filter(|a| !a.is_empty());

    match (name, address) {
        (Some(name), Some(address)) => Some(format!("{} <{}>", name, address)),
        (None, Some(address)) => Some(address.to_string()),
        (Some(name), None) => Some(name.to_string()),
        (None, None) => None,
    }
}

/// Render an address header the way mail clients show it: `Name <addr>, addr2`.
fn address_display(value: &HeaderValue) -> Option<String> {
    let rendered: Vec<String> = match value {
        HeaderValue::Address(addr) => format_addr(addr).into_iter().collect(),
        HeaderValue::AddressList(list) => list.iter().filter_map(format_addr).collect(),
        HeaderValue::Group(group) => group.addresses.iter().filter_map(format_addr).collect(),
        HeaderValue::GroupList(groups) => groups
            .iter()
            .flat_map(|g| g.addresses.iter().filter_map(format_addr))
            .collect(),
        HeaderValue::Text(text) => vec![text.trim().to_string()],
        _ => Vec::new(),
    };

    let rendered: Vec<String> = rendered.into_iter().filter(|s| !s.is_empty()).collect();
    if rendered.is_empty() {
        None
    } else {
        Some(rendered.join(", "))
    }
}
