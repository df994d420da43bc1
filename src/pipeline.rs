//! One retrieval attempt: connect, search, fetch, parse, filter, flag, disconnect.

use chrono::Utc;

use crate::config::MailboxCredentials;
use crate::filter::filter_and_sort;
use crate::mailbox::{Connector, MailboxError, MailboxSession};
use crate::message::{parse_batch, NormalizedMessage, RawFetchedMessage};
use crate::query::{build_query, SearchQuery, SearchRequest};

/// Search and fetch full bodies for every hit.
pub fn fetch_messages(
    session: &mut dyn MailboxSession,
    query: &SearchQuery,
) -> Result<Vec<RawFetchedMessage>, MailboxError> {
    let ids = session.search(query)?;
    if ids.is_empty() {
        return Ok(Vec::new());
    }

    let messages = session.fetch(&ids)?;
    log::debug!("Fetched {} of {} matched messages", messages.len(), ids.len());
    Ok(messages)
}

/// Mark fetched messages seen. A failure is logged and otherwise ignored.
pub fn commit_seen(session: &mut dyn MailboxSession, ids: &[u32]) -> bool {
    if ids.is_empty() {
        return true;
    }

    match session.mark_seen(ids) {
        Ok(()) => {
            log::debug!("Marked {} messages as seen", ids.len());
            true
        }
        Err(e) => {
            log::warn!("Failed to mark {} messages as seen: {}", ids.len(), e);
            false
        }
    }
}

fn run_on_session(
    session: &mut dyn MailboxSession,
    host: &str,
    request: &SearchRequest,
) -> Result<Vec<NormalizedMessage>, MailboxError> {
    let query = build_query(request, host);
    let raw = fetch_messages(session, &query)?;
    if raw.is_empty() {
        return Ok(Vec::new());
    }

    let fetched_ids: Vec<u32> = raw.iter().map(|m| m.sequence_id).collect();
    let parsed = parse_batch(&raw, Utc::now());
    drop(raw);

    let matched = filter_and_sort(parsed, &request.target_alias);

    // Everything fetched is consumed, including over-matches, so an unread
    // search does not hand the same messages back on the next poll.
    if request.mark_seen {
        commit_seen(session, &fetched_ids);
    }

    Ok(matched)
}

/// Run one attempt against a fresh connection. The connection is always closed.
pub fn run_attempt(
    connector: &dyn Connector,
    credentials: &MailboxCredentials,
    request: &SearchRequest,
) -> Result<Vec<NormalizedMessage>, MailboxError> {
    let mut session = connector.open(credentials)?;
    let result = run_on_session(session.as_mut(), &credentials.host, request);
    session.close();
    result
}
