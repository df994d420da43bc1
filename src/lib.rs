pub mod config;
pub mod filter;
pub mod mailbox;
pub mod message;
pub mod pipeline;
pub mod poller;
pub mod query;
pub mod relay;

// Re-export commonly used types
pub use config::{resolve, ConfigError, EffectiveConfig, MailboxCredentials, RelaySettings};
pub use mailbox::{Connector, ImapConnector, MailboxError, MailboxSession};
pub use message::{NormalizedMessage, ParseError, RawFetchedMessage};
pub use poller::{poll_with_retry, PollError, ProgressCallback, RetryPolicy};
pub use query::{build_query, SearchQuery, SearchRequest};
pub use relay::{ConnectionTestResult, MailRelay, PollOptions};
