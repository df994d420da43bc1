//! Server-side search query selection.
//!
//! Mail servers disagree on how "addressed to X and unread" should be asked.
//! Gmail matches recipients reliably only through its own `X-GM-RAW` search
//! language, while most other servers do fine with a plain `HEADER TO` search.
//! The choice is a lookup in [`PROVIDER_DIALECTS`]; unknown hosts get the
//! structured form.

use crate::config::ConfigError;

/// What one poll attempt is looking for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    pub target_alias: String,
    pub unseen_only: bool,
    pub mark_seen: bool,
}

impl SearchRequest {
    pub fn new(target_alias: &str) -> Result<Self, ConfigError> {
        let alias = target_alias.trim();
        if alias.is_empty() || !alias.contains('@') {
            return Err(ConfigError::InvalidAlias(target_alias.to_string()));
        }

        Ok(Self {
            target_alias: alias.to_string(),
            unseen_only: true,
            mark_seen: true,
        })
    }

    pub fn include_seen(mut self) -> Self {
        self.unseen_only = false;
        self
    }

    pub fn keep_unseen(mut self) -> Self {
        self.mark_seen = false;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchPredicate {
    HeaderTo(String),
    Unseen,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchQuery {
    /// Provider-specific expression, sent through `X-GM-RAW`.
    Raw(String),
    /// Conjunction of standard IMAP search keys.
    Structured(Vec<SearchPredicate>),
}

impl SearchQuery {
    /// Render as the argument of an IMAP `UID SEARCH` command.
    pub fn to_imap(&self) -> String {
        match self {
            SearchQuery::Raw(expr) => format!("X-GM-RAW {}", quote(expr)),
            SearchQuery::Structured(predicates) => predicates
                .iter()
                .map(|p| match p {
                    SearchPredicate::HeaderTo(addr) => format!("HEADER TO {}", quote(addr)),
                    SearchPredicate::Unseen => "UNSEEN".to_string(),
                })
                .collect::<Vec<_>>()
                .join(" "),
        }
    }

    pub fn is_raw(&self) -> bool {
        matches!(self, SearchQuery::Raw(_))
    }
}

pub type QueryBuilder = fn(&SearchRequest) -> SearchQuery;

/// Host substring to query dialect. Adding a provider is a new row here.
pub const PROVIDER_DIALECTS: &[(&str, QueryBuilder)] = &[
    ("gmail", gmail_raw_query),
    ("googlemail", gmail_raw_query),
];

pub fn build_query(request: &SearchRequest, host_hint: &str) -> SearchQuery {
    let host = host_hint.to_lowercase();

    let builder = PROVIDER_DIALECTS
        .iter()
        .find(|(hint, _)| host.contains(*hint))
        .map(|(_, builder)| *builder)
        .unwrap_or(structured_query as QueryBuilder);

    let query = builder(request);
    log::debug!("Search query for host '{}': {}", host_hint, query.to_imap());
    query
}

pub fn structured_query(request: &SearchRequest) -> SearchQuery {
    let mut predicates = vec![SearchPredicate::HeaderTo(request.target_alias.clone())];
    if request.unseen_only {
        predicates.push(SearchPredicate::Unseen);
    }
    SearchQuery::Structured(predicates)
}

fn gmail_raw_query(request: &SearchRequest) -> SearchQuery {
    let mut expr = format!("to:{}", request.target_alias);
    if request.unseen_only {
        expr.push_str(" is:unread");
    }
    SearchQuery::Raw(expr)
}

fn quote(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{}\"", escaped)
}
