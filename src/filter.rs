use std::cmp::Reverse;

use crate::message::NormalizedMessage;

/// Keep only messages whose `To` really contains `alias`, newest first.
///
/// Server-side searches can over-match (partial addresses, catch-all
/// artifacts), so this runs even when the query already constrained the
/// recipient. The sort is stable: equal or missing dates keep fetch order.
pub fn filter_and_sort(messages: Vec<NormalizedMessage>, alias: &str) -> Vec<NormalizedMessage> {
    let fetched = messages.len();

    let mut matched: Vec<NormalizedMessage> = messages
        .into_iter()
        .filter(|m| m.is_addressed_to(alias))
        .collect();

    if matched.len() < fetched {
        log::debug!(
            "Dropped {} of {} messages not addressed to {}",
            fetched - matched.len(),
            fetched,
            alias
        );
    }

    matched.sort_by_key(|m| Reverse(m.sort_timestamp()));
    matched
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};

    fn message(id: u32, to: &str, date: Option<DateTime<Utc>>) -> NormalizedMessage {
        let fetched_at = Utc.with_ymd_and_hms(2026, 10, 17, 12, 0, 0).unwrap();
        NormalizedMessage {
            id,
            subject: format!("message {}", id),
            from_display: "sender@example.com".to_string(),
            to_display: to.to_string(),
            date: date.unwrap_or(fetched_at),
            dated: date.is_some(),
            plain_text: String::new(),
            html: String::new(),
            flags: Vec::new(),
            received_at: fetched_at,
        }
    }

    fn at(hour: u32) -> Option<DateTime<Utc>> {
        Some(Utc.with_ymd_and_hms(2026, 10, 17, hour, 0, 0).unwrap())
    }

    fn ids(messages: &[NormalizedMessage]) -> Vec<u32> {
        messages.iter().map(|m| m.id).collect()
    }

    #[test]
    fn test_newest_first() {
        let alias = "x@relay.test";
        let sorted = filter_and_sort(
            vec![message(1, alias, at(1)), message(2, alias, at(2)), message(3, alias, at(3))],
            alias,
        );
        assert_eq!(ids(&sorted), vec![3, 2, 1]);
    }

    #[test]
    fn test_undated_sort_last_in_fetch_order() {
        let alias = "x@relay.test";
        let sorted = filter_and_sort(
            vec![
                message(1, alias, None),
                message(2, alias, at(5)),
                message(3, alias, None),
                message(4, alias, at(5)),
            ],
            alias,
        );
        assert_eq!(ids(&sorted), vec![2, 4, 1, 3]);
    }

    #[test]
    fn test_filter_is_case_insensitive_and_exact_about_recipient() {
        let sorted = filter_and_sort(
            vec![
                message(1, "ABC123@Domain.Test", at(1)),
                message(2, "abc124@domain.test", at(2)),
                message(3, "Someone <abc123@domain.test>, other@domain.test", at(3)),
                message(4, "", at(4)),
            ],
            "abc123@domain.test",
        );
        assert_eq!(ids(&sorted), vec![3, 1]);
    }

    // Every input message either survives or is provably not addressed to the alias.
    #[test]
    fn test_filter_neither_admits_nor_rejects_wrongly() {
        let alias = "k9@relay.test";
        let recipients = [
            "k9@relay.test",
            "K9@RELAY.TEST",
            "k8@relay.test",
            "Name <k9@relay.test>",
            "k9@relay.tes",
            "prefix-k9@relay.test",
        ];
        let input: Vec<NormalizedMessage> = recipients
            .iter()
            .enumerate()
            .map(|(i, to)| message(i as u32, to, None))
            .collect();

        let kept = filter_and_sort(input.clone(), alias);

        for m in &input {
            let expected = m.to_display.to_lowercase().contains(alias);
            assert_eq!(kept.iter().any(|k| k.id == m.id), expected, "recipient {}", m.to_display);
        }
        assert!(kept.iter().all(|m| m.is_addressed_to(alias)));
    }
}
