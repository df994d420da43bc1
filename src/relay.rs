use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::{resolve, RelaySettings};
use crate::mailbox::{Connector, ImapConnector, MailboxError};
use crate::message::NormalizedMessage;
use crate::pipeline::run_attempt;
use crate::poller::{poll_with_retry, PollError, ProgressCallback, RetryPolicy};
use crate::query::SearchRequest;

/// Outcome of a "can we log in at all" probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionTestResult {
    pub success: bool,
    pub message: String,
}

/// Per-call knobs for [`MailRelay::poll`].
#[derive(Clone, Default)]
pub struct PollOptions {
    /// Settings layered over the relay's defaults for this call only.
    pub overrides: RelaySettings,
    pub on_attempt: Option<ProgressCallback>,
    /// Stop starting new attempts after this long. A running attempt finishes.
    pub deadline: Option<Duration>,
    /// Also match messages that are already marked seen.
    pub include_seen: bool,
    /// Do not mark fetched messages as seen.
    pub keep_unseen: bool,
}

/// Retrieves mail sent to generated aliases from one shared mailbox.
#[derive(Clone)]
pub struct MailRelay {
    connector: Arc<dyn Connector>,
    defaults: RelaySettings,
}

impl MailRelay {
    pub fn new(defaults: RelaySettings) -> Self {
        Self::with_connector(Arc::new(ImapConnector), defaults)
    }

    pub fn from_env() -> Self {
        Self::new(RelaySettings::from_env())
    }

    pub fn with_connector(connector: Arc<dyn Connector>, defaults: RelaySettings) -> Self {
        Self { connector, defaults }
    }

    pub fn defaults(&self) -> &RelaySettings {
        &self.defaults
    }

    /// Poll until mail to `alias` shows up, the retry budget is spent or the
    /// deadline passes.
    ///
    /// `Ok(vec![])` means nothing arrived in time, whether attempts or time ran
    /// out; an `Err` means the mailbox could not be read at all.
    pub async fn poll(&self, alias: &str, options: PollOptions) -> Result<Vec<NormalizedMessage>, PollError> {
        let config = resolve(&self.defaults, &options.overrides)?;

        let mut request = SearchRequest::new(alias)?;
        if options.include_seen {
            request = request.include_seen();
        }
        if options.keep_unseen {
            request = request.keep_unseen();
        }

        let mut policy = RetryPolicy::new(config.max_attempts, config.delay).with_deadline(options.deadline);
        if let Some(callback) = options.on_attempt {
            policy = policy.with_progress(callback);
        }

        log::info!(
            "Polling {} for mail to {} ({} attempts, {:?} apart)",
            config.credentials.host,
            request.target_alias,
            policy.attempts(),
            policy.delay
        );

        let credentials = Arc::new(config.credentials);
        let request = Arc::new(request);

        poll_with_retry(&policy, |_| {
            let connector = Arc::clone(&self.connector);
            let credentials = Arc::clone(&credentials);
            let request = Arc::clone(&request);

            async move {
                tokio::task::spawn_blocking(move || run_attempt(connector.as_ref(), &credentials, &request))
                    .await
                    .map_err(|e| MailboxError::Worker(e.to_string()))?
            }
        })
        .await
    }

    /// A single attempt without retrying.
    pub async fn fetch_once(
        &self,
        alias: &str,
        overrides: &RelaySettings,
    ) -> Result<Vec<NormalizedMessage>, PollError> {
        let mut overrides = overrides.clone();
        overrides.polling.times = Some(1);

        self.poll(
            alias,
            PollOptions {
                overrides,
                ..PollOptions::default()
            },
        )
        .await
    }

    /// Check that the mailbox accepts a login, without touching any message.
    pub async fn test_connection(&self, overrides: &RelaySettings) -> ConnectionTestResult {
        let config = match resolve(&self.defaults, overrides) {
            Ok(config) => config,
            Err(e) => {
                return ConnectionTestResult {
                    success: false,
                    message: e.to_string(),
                }
            }
        };

        let connector = Arc::clone(&self.connector);
        let credentials = config.credentials;
        let host = credentials.host.clone();

        let outcome = tokio::task::spawn_blocking(move || {
            connector.open(&credentials).map(|mut session| session.close())
        })
        .await;

        match outcome {
            Ok(Ok(())) => ConnectionTestResult {
                success: true,
                message: format!("IMAP connection to {} succeeded", host),
            },
            Ok(Err(e)) => ConnectionTestResult {
                success: false,
                message: e.to_string(),
            },
            Err(e) => ConnectionTestResult {
                success: false,
                message: format!("Connection test aborted: {}", e),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::config::ConfigError;
    use crate::mailbox::testing::ScriptedConnector;

    fn settings(host: &str, times: u32) -> RelaySettings {
        RelaySettings::from_vars([
            ("IMAP_USER", "catchall@example.com".to_string()),
            ("IMAP_PASS", "secret".to_string()),
            ("IMAP_HOST", host.to_string()),
            ("IMAP_RETRY_TIMES", times.to_string()),
            ("IMAP_RETRY_DELAY", "10".to_string()),
        ])
    }

    fn relay(connector: &ScriptedConnector, host: &str, times: u32) -> MailRelay {
        MailRelay::with_connector(Arc::new(connector.clone()), settings(host, times))
    }

    #[tokio::test]
    async fn test_end_to_end_single_message() {
        let connector = ScriptedConnector::new();
        connector.deliver(
            9,
            "From: Bob <bob@example.com>\nTo: ABC123@domain.test\nSubject: Hi\nDate: Sat, 17 Oct 2026 11:00:00 +0000\n\nHello there",
        );

        let messages = relay(&connector, "mail.domain.test", 3)
            .poll("abc123@domain.test", PollOptions::default())
            .await
            .unwrap();

        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].subject, "Hi");
        assert_eq!(messages[0].from_display, "Bob <bob@example.com>");
        assert!(messages[0].is_addressed_to("abc123@domain.test"));
        assert!(connector.message(9).is_seen());
        assert_eq!(connector.state.lock().unwrap().opens, 1);
    }

    #[tokio::test]
    async fn test_empty_mailbox_notifies_then_returns_empty() {
        let connector = ScriptedConnector::new();
        let notified = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&notified);

        let messages = relay(&connector, "imap.qq.com", 3)
            .poll(
                "nobody@domain.test",
                PollOptions {
                    on_attempt: Some(Arc::new(move |_: u32, _: u32, _: Duration| {
                        counter.fetch_add(1, Ordering::SeqCst);
                    })),
                    ..PollOptions::default()
                },
            )
            .await
            .unwrap();

        assert!(messages.is_empty());
        assert_eq!(notified.load(Ordering::SeqCst), 2);
        assert_eq!(connector.state.lock().unwrap().opens, 3);
    }

    #[tokio::test]
    async fn test_message_arriving_between_attempts() {
        let connector = ScriptedConnector::new();
        let mailbox = connector.clone();

        let messages = relay(&connector, "imap.gmail.com", 5)
            .poll(
                "late@domain.test",
                PollOptions {
                    on_attempt: Some(Arc::new(move |attempt: u32, _: u32, _: Duration| {
                        if attempt == 2 {
                            mailbox.deliver(3, "To: late@domain.test\nSubject: finally\n\nhi");
                        }
                    })),
                    ..PollOptions::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].subject, "finally");
        assert_eq!(connector.state.lock().unwrap().opens, 3);
    }

    #[tokio::test]
    async fn test_connect_failure_exhausts_budget() {
        let connector = ScriptedConnector::new();
        connector.state.lock().unwrap().refuse_connect = Some("authentication failed".to_string());

        let err = relay(&connector, "imap.qq.com", 2)
            .poll("abc@domain.test", PollOptions::default())
            .await
            .unwrap_err();

        match err {
            PollError::Exhausted { attempts, source } => {
                assert_eq!(attempts, 2);
                assert!(source.to_string().contains("authentication failed"));
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(connector.state.lock().unwrap().opens, 2);
    }

    #[tokio::test]
    async fn test_slow_fetch_past_deadline_still_delivers() {
        let connector = ScriptedConnector::new();
        connector.deliver(5, "To: slow@domain.test\nSubject: slow\n\nhi");
        connector.state.lock().unwrap().fetch_delay = Some(Duration::from_millis(300));
        let relay = relay(&connector, "imap.qq.com", 5);

        let messages = relay
            .poll(
                "slow@domain.test",
                PollOptions {
                    deadline: Some(Duration::from_millis(100)),
                    ..PollOptions::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].subject, "slow");
        assert!(connector.message(5).is_seen());
        assert_eq!(connector.state.lock().unwrap().opens, 1);
    }

    #[tokio::test]
    async fn test_deadline_on_empty_mailbox_is_empty_result() {
        let connector = ScriptedConnector::new();

        let messages = relay(&connector, "imap.qq.com", 1000)
            .poll(
                "nobody@domain.test",
                PollOptions {
                    deadline: Some(Duration::from_millis(50)),
                    ..PollOptions::default()
                },
            )
            .await
            .unwrap();

        assert!(messages.is_empty());
        assert!(connector.state.lock().unwrap().opens < 1000);
    }

    #[tokio::test]
    async fn test_missing_credentials_fail_before_network() {
        let connector = ScriptedConnector::new();
        let relay = MailRelay::with_connector(Arc::new(connector.clone()), RelaySettings::default());

        let err = relay.poll("abc@domain.test", PollOptions::default()).await.unwrap_err();

        assert!(matches!(err, PollError::Config(ConfigError::MissingField(_))));
        assert_eq!(connector.state.lock().unwrap().opens, 0);
    }

    #[tokio::test]
    async fn test_invalid_alias_is_config_error() {
        let connector = ScriptedConnector::new();
        let err = relay(&connector, "imap.qq.com", 2)
            .poll("not-an-address", PollOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err, PollError::Config(ConfigError::InvalidAlias(_))));
        assert_eq!(connector.state.lock().unwrap().opens, 0);
    }

    #[tokio::test]
    async fn test_per_call_overrides_apply() {
        let connector = ScriptedConnector::new();
        let mut overrides = RelaySettings::default();
        overrides.imap.host = Some("imap.gmail.com".to_string());
        overrides.polling.times = Some(1);

        relay(&connector, "imap.qq.com", 5)
            .poll(
                "abc@domain.test",
                PollOptions {
                    overrides,
                    ..PollOptions::default()
                },
            )
            .await
            .unwrap();

        let state = connector.state.lock().unwrap();
        assert_eq!(state.opens, 1);
        assert!(state.searches[0].is_raw());
    }

    #[tokio::test]
    async fn test_fetch_once_makes_one_attempt() {
        let connector = ScriptedConnector::new();
        let messages = relay(&connector, "imap.qq.com", 10)
            .fetch_once("abc@domain.test", &RelaySettings::default())
            .await
            .unwrap();

        assert!(messages.is_empty());
        assert_eq!(connector.state.lock().unwrap().opens, 1);
    }

    #[tokio::test]
    async fn test_include_seen_returns_already_read_mail() {
        let connector = ScriptedConnector::new();
        connector.deliver(1, "To: abc@domain.test\nSubject: old\n\nhi");
        let relay = relay(&connector, "imap.qq.com", 1);

        assert_eq!(relay.poll("abc@domain.test", PollOptions::default()).await.unwrap().len(), 1);
        assert!(relay.poll("abc@domain.test", PollOptions::default()).await.unwrap().is_empty());

        let again = relay
            .poll(
                "abc@domain.test",
                PollOptions {
                    include_seen: true,
                    ..PollOptions::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(again.len(), 1);
    }

    #[tokio::test]
    async fn test_connection_probe() {
        let connector = ScriptedConnector::new();
        let ok = relay(&connector, "imap.qq.com", 1).test_connection(&RelaySettings::default()).await;
        assert!(ok.success);
        assert_eq!(connector.state.lock().unwrap().closes, 1);

        connector.state.lock().unwrap().refuse_connect = Some("bad password".to_string());
        let refused = relay(&connector, "imap.qq.com", 1).test_connection(&RelaySettings::default()).await;
        assert!(!refused.success);
        assert!(refused.message.contains("bad password"));

        let incomplete = MailRelay::with_connector(Arc::new(connector.clone()), RelaySettings::default())
            .test_connection(&RelaySettings::default())
            .await;
        assert!(!incomplete.success);
        assert!(incomplete.message.contains("incomplete"));
    }
}
