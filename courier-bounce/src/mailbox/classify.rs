use std::sync::LazyLock;

use courier_common::BounceType;
use regex::bytes::Regex;

/// Enhanced status codes as they appear in delivery status reports and
/// diagnostic lines, e.g. `Status: 5.1.1` or `550 5.1.1 user unknown`.
static SMTP_STATUS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?mi)^(?:Status:\s*)?(?:\d{3}\s+)?([45]\.\d+\.\d+)")
        .expect("valid status pattern")
});

static HARD_BOUNCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"(?i)(NXDOMAIN|user unknown|address not found|mailbox not found|address.*reject|",
        r"does not exist|invalid recipient|no such user|recipient.*invalid|undeliverable|",
        r"permanent.*failure|permanent.*error|bad.*address|unknown.*user|account.*disabled|",
        r"address.*disabled)"
    ))
    .expect("valid hard bounce pattern")
});

/// Guesses the bounce type of a bounce e-mail, returning the reason the
/// decision was made on.
pub fn classify(message: &[u8]) -> (BounceType, String) {
    if let Some(status) = SMTP_STATUS
        .captures(message)
        .and_then(|captures| captures.get(1))
    {
        let status = String::from_utf8_lossy(status.as_bytes());
        let kind = if status.starts_with('5') {
            BounceType::Hard
        } else {
            BounceType::Soft
        };
        return (kind, format!("smtp_status={status}"));
    }

    if let Some(matched) = HARD_BOUNCE.find(message) {
        return (
            BounceType::Hard,
            format!("body_match={}", String::from_utf8_lossy(matched.as_bytes())),
        );
    }

    (BounceType::Soft, "default".to_string())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            classify(b"Reporting-MTA: dns; mx.example.com\r\nStatus: 5.1.1\r\n"),
            (BounceType::Hard, "smtp_status=5.1.1".to_string())
        );
        assert_eq!(
            classify(b"Diagnostic:\r\n452 4.2.2 mailbox full\r\n"),
            (BounceType::Soft, "smtp_status=4.2.2".to_string())
        );
    }

    #[test]
    fn test_status_takes_precedence_over_phrases() {
        assert_eq!(
            classify(b"The message was undeliverable\r\nStatus: 4.4.1\r\n").0,
            BounceType::Soft
        );
    }

    #[test]
    fn test_phrases() {
        assert_eq!(
            classify(b"Delivery failed: No such user here"),
            (BounceType::Hard, "body_match=No such user".to_string())
        );
        assert_eq!(
            classify(b"Your message is delayed"),
            (BounceType::Soft, "default".to_string())
        );
    }
}
