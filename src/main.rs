use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use rand::Rng;

use relaymail::{MailRelay, NormalizedMessage, PollError, PollOptions, RelaySettings};

/// Receive mail sent to disposable aliases through a shared IMAP mailbox
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Path to config file (defaults to the user config directory)
    #[clap(short, long)]
    config: Option<String>,

    /// Enable debug logging
    #[clap(short, long)]
    debug: bool,

    /// Accept invalid TLS certificates (self-hosted servers)
    #[clap(long)]
    insecure: bool,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Wait for mail addressed to an alias
    Poll {
        /// Alias to wait for; generated when omitted
        #[clap(short, long)]
        alias: Option<String>,

        /// Domain used when generating an alias
        #[clap(long)]
        domain: Option<String>,

        /// Number of attempts
        #[clap(long)]
        times: Option<u32>,

        /// Delay between attempts in milliseconds
        #[clap(long)]
        delay_ms: Option<u64>,

        /// Give up after this many seconds regardless of attempts left
        #[clap(long)]
        deadline_secs: Option<u64>,

        /// Also match messages already marked as read
        #[clap(long)]
        all: bool,

        /// Leave fetched messages unread
        #[clap(long)]
        keep_unseen: bool,

        /// Print messages as JSON
        #[clap(long)]
        json: bool,
    },

    /// Check that the mailbox accepts our credentials
    TestConnection,

    /// Print the effective settings with the password hidden
    ShowConfig,

    /// Print a fresh random alias
    GenerateAlias {
        #[clap(long)]
        domain: Option<String>,
    },
}

const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

fn generate_alias(domain: &str) -> String {
    let mut rng = rand::thread_rng();
    let prefix: String = (0..10)
        .map(|_| BASE36[rng.gen_range(0..BASE36.len())] as char)
        .collect();

    format!("test-{}@{}", prefix, domain)
}

fn default_config_path() -> String {
    dirs::config_dir()
        .map(|dir| dir.join("relaymail").join("config.json"))
        .map(|path| path.to_string_lossy().into_owned())
        .unwrap_or_else(|| "relaymail.json".to_string())
}

fn pick_domain(flag: Option<String>, settings: &RelaySettings) -> Result<String> {
    match flag.or_else(|| settings.domain.clone()) {
        Some(domain) => Ok(domain),
        None => bail!("No alias domain configured. Pass --domain or set EMAIL_DOMAIN"),
    }
}

fn print_message(index: usize, message: &NormalizedMessage) {
    println!("Message {}:", index + 1);
    println!("  From:    {}", message.from_display);
    println!("  To:      {}", message.to_display);
    println!("  Subject: {}", message.subject);
    println!("  Date:    {}", message.date.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S"));
    println!();
    if message.plain_text.trim().is_empty() {
        println!("(no plain text content)");
    } else {
        println!("{}", message.plain_text.trim_end());
    }
    println!("--------------------------------------------------");
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(if args.debug { log::LevelFilter::Debug } else { log::LevelFilter::Info })
        .init();

    let config_path = args
        .config
        .as_deref()
        .map(|p| shellexpand::tilde(p).into_owned())
        .unwrap_or_else(default_config_path);
    let file_settings = RelaySettings::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;

    let mut defaults = RelaySettings::from_env().merged_with(&file_settings);
    if args.insecure {
        defaults.imap.accept_invalid_certs = Some(true);
    }

    match args.command {
        Commands::Poll {
            alias,
            domain,
            times,
            delay_ms,
            deadline_secs,
            all,
            keep_unseen,
            json,
        } => {
            let alias = match alias {
                Some(alias) => alias,
                None => generate_alias(&pick_domain(domain, &defaults)?),
            };
            println!("Waiting for mail to: {}", alias);

            let mut overrides = RelaySettings::default();
            overrides.polling.times = times;
            overrides.polling.delay_ms = delay_ms;

            let options = PollOptions {
                overrides,
                on_attempt: Some(Arc::new(|attempt: u32, total: u32, delay: Duration| {
                    println!(
                        "Attempt {}/{}: no mail yet, retrying in {:.1}s...",
                        attempt,
                        total,
                        delay.as_secs_f64()
                    );
                })),
                deadline: deadline_secs.map(Duration::from_secs),
                include_seen: all,
                keep_unseen,
            };

            let relay = MailRelay::new(defaults);
            let messages = match relay.poll(&alias, options).await {
                Ok(messages) => messages,
                Err(PollError::Config(e)) => bail!("{}", e),
                Err(e) => return Err(e).context("Could not retrieve mail; check the IMAP settings and network"),
            };

            if json {
                println!("{}", serde_json::to_string_pretty(&messages)?);
            } else if messages.is_empty() {
                println!("No mail arrived in time. Check that:");
                println!("  - the catch-all forwarding for the alias domain is active");
                println!("  - the IMAP settings point at the mailbox receiving the forwards");
                println!("  - the message was not filtered as spam");
            } else {
                println!("Found {} message(s)", messages.len());
                println!("--------------------------------------------------");
                for (i, message) in messages.iter().enumerate() {
                    print_message(i, message);
                }
            }
        }
        Commands::TestConnection => {
            let result = MailRelay::new(defaults).test_connection(&RelaySettings::default()).await;
            println!("{}", result.message);
            if !result.success {
                bail!("Connection test failed");
            }
        }
        Commands::ShowConfig => {
            println!("Config file: {}", config_path);
            println!("{}", serde_json::to_string_pretty(&defaults.redacted())?);
        }
        Commands::GenerateAlias { domain } => {
            println!("{}", generate_alias(&pick_domain(domain, &defaults)?));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_alias_shape() {
        let alias = generate_alias("relay.test");
        let (local, domain) = alias.split_once('@').unwrap();

        assert_eq!(domain, "relay.test");
        assert!(local.starts_with("test-"));
        assert_eq!(local.len(), "test-".len() + 10);
        assert!(local["test-".len()..].bytes().all(|b| BASE36.contains(&b)));
    }

    #[test]
    fn test_generated_aliases_differ() {
        let first = generate_alias("relay.test");
        let second = generate_alias("relay.test");
        assert_ne!(first, second);
    }

    #[test]
    fn test_domain_flag_wins_over_settings() {
        let mut settings = RelaySettings::default();
        settings.domain = Some("from-settings.test".to_string());

        assert_eq!(pick_domain(Some("flag.test".into()), &settings).unwrap(), "flag.test");
        assert_eq!(pick_domain(None, &settings).unwrap(), "from-settings.test");
        assert!(pick_domain(None, &RelaySettings::default()).is_err());
    }
}
