use std::collections::HashSet;
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};

use imap::Session;
use native_tls::TlsConnector;
use thiserror::Error;

use crate::config::MailboxCredentials;
use crate::message::RawFetchedMessage;
use crate::query::SearchQuery;

pub const INBOX: &str = "INBOX";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MailboxError {
    #[error("IMAP connection failed: {0}")]
    Connect(String),

    #[error("IMAP search failed: {0}")]
    Search(String),

    #[error("IMAP fetch failed: {0}")]
    Fetch(String),

    #[error("IMAP flag update failed: {0}")]
    Flag(String),

    #[error("Mailbox worker failed: {0}")]
    Worker(String),
}

/// An open, logged-in mailbox with INBOX selected.
pub trait MailboxSession: Send {
    /// UIDs matching `query`, ascending.
    fn search(&mut self, query: &SearchQuery) -> Result<Vec<u32>, MailboxError>;

    /// Full message source and flags for each UID.
    fn fetch(&mut self, ids: &[u32]) -> Result<Vec<RawFetchedMessage>, MailboxError>;

    fn mark_seen(&mut self, ids: &[u32]) -> Result<(), MailboxError>;

    /// Log out. Safe to call more than once.
    fn close(&mut self);
}

pub trait Connector: Send + Sync {
    fn open(&self, credentials: &MailboxCredentials) -> Result<Box<dyn MailboxSession>, MailboxError>;
}

/// Connector for real IMAP servers.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImapConnector;

impl Connector for ImapConnector {
    fn open(&self, credentials: &MailboxCredentials) -> Result<Box<dyn MailboxSession>, MailboxError> {
        log::debug!(
            "Connecting to {}:{} as {} (tls={}, verify={})",
            credentials.host,
            credentials.port,
            credentials.username,
            credentials.use_tls,
            !credentials.tls_insecure_skip_verify
        );

        let tcp = connect_tcp(credentials)?;

        if credentials.use_tls {
            let mut builder = TlsConnector::builder();
            if credentials.tls_insecure_skip_verify {
                builder
                    .danger_accept_invalid_certs(true)
                    .danger_accept_invalid_hostnames(true);
            }
            let tls = builder
                .build()
                .map_err(|e| MailboxError::Connect(format!("TLS setup failed: {}", e)))?;

            let stream = tls
                .connect(&credentials.host, tcp)
                .map_err(|e| MailboxError::Connect(format!("TLS handshake failed: {}", e)))?;

            login(stream, credentials)
        } else {
            login(tcp, credentials)
        }
    }
}

fn connect_tcp(credentials: &MailboxCredentials) -> Result<TcpStream, MailboxError> {
    let addrs = (credentials.host.as_str(), credentials.port)
        .to_socket_addrs()
        .map_err(|e| MailboxError::Connect(format!("cannot resolve {}: {}", credentials.host, e)))?;

    let mut last_error = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, credentials.io_timeout) {
            Ok(stream) => {
                stream
                    .set_read_timeout(Some(credentials.io_timeout))
                    .and_then(|_| stream.set_write_timeout(Some(credentials.io_timeout)))
                    .map_err(|e| MailboxError::Connect(e.to_string()))?;
                return Ok(stream);
            }
            Err(e) => last_error = Some(e),
        }
    }

    Err(MailboxError::Connect(match last_error {
        Some(e) => format!("{}:{} unreachable: {}", credentials.host, credentials.port, e),
        None => format!("no address found for {}", credentials.host),
    }))
}

fn login<T>(stream: T, credentials: &MailboxCredentials) -> Result<Box<dyn MailboxSession>, MailboxError>
where
    T: Read + Write + Send + 'static,
{
    let mut client = imap::Client::new(stream);
    client
        .read_greeting()
        .map_err(|e| MailboxError::Connect(format!("no greeting from server: {}", e)))?;

    let mut session = client
        .login(&credentials.username, &credentials.secret)
        .map_err(|e| MailboxError::Connect(format!("login rejected: {}", e.0)))?;

    if let Err(e) = session.select(INBOX) {
        let _ = session.logout();
        return Err(MailboxError::Connect(format!("cannot select {}: {}", INBOX, e)));
    }

    Ok(Box::new(ImapMailbox { session: Some(session) }))
}

struct ImapMailbox<T: Read + Write> {
    session: Option<Session<T>>,
}

impl<T: Read + Write> ImapMailbox<T> {
    fn session(&mut self) -> Result<&mut Session<T>, String> {
        self.session.as_mut().ok_or_else(|| "session already closed".to_string())
    }
}

fn uid_set(ids: &[u32]) -> String {
    ids.iter().map(u32::to_string).collect::<Vec<_>>().join(",")
}

impl<T: Read + Write + Send> MailboxSession for ImapMailbox<T> {
    fn search(&mut self, query: &SearchQuery) -> Result<Vec<u32>, MailboxError> {
        let session = self.session().map_err(MailboxError::Search)?;
        let found = session
            .uid_search(query.to_imap())
            .map_err(|e| MailboxError::Search(e.to_string()))?;

        let mut ids: Vec<u32> = found.into_iter().collect();
        ids.sort_unstable();
        log::debug!("Search matched {} messages", ids.len());
        Ok(ids)
    }

    fn fetch(&mut self, ids: &[u32]) -> Result<Vec<RawFetchedMessage>, MailboxError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let session = self.session().map_err(MailboxError::Fetch)?;
        let fetched = session
            .uid_fetch(uid_set(ids), "(RFC822 FLAGS UID)")
            .map_err(|e| MailboxError::Fetch(e.to_string()))?;

        let mut messages = Vec::with_capacity(fetched.len());
        for message in fetched.iter() {
            let Some(uid) = message.uid else {
                log::warn!("Server returned a message without UID, ignoring it");
                continue;
            };

            let flags: HashSet<String> = message.flags().iter().map(|f| f.to_string()).collect();

            messages.push(RawFetchedMessage {
                sequence_id: uid,
                mime_source: message.body().map(|b| b.to_vec()).unwrap_or_default(),
                flags,
            });
        }

        messages.sort_by_key(|m| m.sequence_id);
        Ok(messages)
    }

    fn mark_seen(&mut self, ids: &[u32]) -> Result<(), MailboxError> {
        if ids.is_empty() {
            return Ok(());
        }

        let session = self.session().map_err(MailboxError::Flag)?;
        session
            .uid_store(uid_set(ids), "+FLAGS (\\Seen)")
            .map_err(|e| MailboxError::Flag(e.to_string()))?;
        Ok(())
    }

    fn close(&mut self) {
        if let Some(mut session) = self.session.take() {
            if let Err(e) = session.logout() {
                log::debug!("IMAP logout failed: {}", e);
            }
        }
    }
}

impl<T: Read + Write> Drop for ImapMailbox<T> {
    fn drop(&mut self) {
        if let Some(mut session) = self.session.take() {
            let _ = session.logout();
        }
    }
}
