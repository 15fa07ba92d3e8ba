//! Common validation utilities.

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use validator::ValidationError;

/// Shortest accepted phone number (digits only, country code included).
const MIN_PHONE_DIGITS: usize = 7;

/// Longest accepted phone number, per E.164.
const MAX_PHONE_DIGITS: usize = 15;

lazy_static! {
    /// Provider chat address such as `120363025@g.us`.
    static ref CHAT_ADDRESS: Regex = Regex::new(r"^[0-9]{5,32}(-[0-9]{5,16})?@[a-z.]{2,32}$").unwrap();
    static ref PHONE_NOISE: Regex = Regex::new(r"[\s\-().]").unwrap();
}

/// Normalizes a recipient address.
///
/// Phone numbers lose separators and the leading `+`; chat addresses are
/// lowercased. Returns `None` when the input is neither.
pub fn normalize_recipient(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.contains('@') {
        let lowered = trimmed.to_ascii_lowercase();
        return CHAT_ADDRESS.is_match(&lowered).then_some(lowered);
    }

    let cleaned = PHONE_NOISE.replace_all(trimmed, "").into_owned();
    let digits = cleaned.strip_prefix('+').unwrap_or(&cleaned);
    let valid = (MIN_PHONE_DIGITS..=MAX_PHONE_DIGITS).contains(&digits.len())
        && digits.chars().all(|c| c.is_ascii_digit())
        && !digits.starts_with('0');
    valid.then(|| digits.to_string())
}

/// Validates that a recipient address can be normalized.
pub fn validate_recipient(raw: &str) -> Result<(), ValidationError> {
    if normalize_recipient(raw).is_some() {
        Ok(())
    } else {
        let mut err = ValidationError::new("recipient_format");
        err.message = Some("Recipient must be a phone number in international format".into());
        Err(err)
    }
}

/// Validates that a media URL is an absolute http(s) URL.
pub fn validate_media_url(url: &str) -> Result<(), ValidationError> {
    let ok = (url.starts_with("https://") || url.starts_with("http://"))
        && url.len() > "https://".len()
        && !url.contains(char::is_whitespace);
    if ok {
        Ok(())
    } else {
        let mut err = ValidationError::new("media_url");
        err.message = Some("Media URL must be an absolute http(s) URL".into());
        Err(err)
    }
}

/// Validates that a schedule instant lies strictly after `now`.
pub fn validate_future_instant(at: DateTime<Utc>, now: DateTime<Utc>) -> Result<(), ValidationError> {
    if at > now {
        Ok(())
    } else {
        let mut err = ValidationError::new("schedule_in_past");
        err.message = Some("Scheduled time must be in the future".into());
        Err(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_normalize_phone_strips_separators() {
        assert_eq!(
            normalize_recipient("+62 812-3456-7890"),
            Some("6281234567890".to_string())
        );
        assert_eq!(
            normalize_recipient("(415) 555.0100"),
            Some("4155550100".to_string())
        );
    }

    #[test]
    fn test_normalize_phone_length_bounds() {
        assert!(normalize_recipient("123456").is_none());
        assert!(normalize_recipient("1234567").is_some());
        assert!(normalize_recipient("123456789012345").is_some());
        assert!(normalize_recipient("1234567890123456").is_none());
    }

    #[test]
    fn test_normalize_rejects_letters_and_leading_zero() {
        assert!(normalize_recipient("12345abc890").is_none());
        assert!(normalize_recipient("0812345678").is_none());
        assert!(normalize_recipient("").is_none());
    }

    #[test]
    fn test_normalize_chat_address() {
        assert_eq!(
            normalize_recipient("120363025246125@G.US"),
            Some("120363025246125@g.us".to_string())
        );
        assert!(normalize_recipient("someone@example.com").is_none());
    }

    #[test]
    fn test_validate_recipient() {
        assert!(validate_recipient("+14155550100").is_ok());
        let err = validate_recipient("nope").unwrap_err();
        assert_eq!(err.code, "recipient_format");
    }

    #[test]
    fn test_validate_media_url() {
        assert!(validate_media_url("https://cdn.example.com/a.png").is_ok());
        assert!(validate_media_url("http://cdn.example.com/a.png").is_ok());
        assert!(validate_media_url("ftp://cdn.example.com/a.png").is_err());
        assert!(validate_media_url("https://").is_err());
        assert!(validate_media_url("https://cdn.example.com/a b.png").is_err());
    }

    #[test]
    fn test_validate_future_instant() {
        let now = Utc::now();
        assert!(validate_future_instant(now + Duration::seconds(1), now).is_ok());
        assert!(validate_future_instant(now, now).is_err());
        assert!(validate_future_instant(now - Duration::seconds(1), now).is_err());
    }
}
