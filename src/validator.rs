// Syntactic checks on a candidate. Pure and deterministic, no I/O.
use lazy_static::lazy_static;
use regex::Regex;
use thiserror::Error;

use crate::models::NotificationCandidate;

pub const MAX_TITLE_CHARS: usize = 100;
pub const MAX_BODY_CHARS: usize = 300;
pub const MAX_PAYLOAD_BYTES: usize = 4096;

const FORBIDDEN_CHARS: [char; 4] = ['<', '>', '{', '}'];

lazy_static! {
    static ref EXPO_TOKEN: Regex = Regex::new(r"^Expo(nent)?PushToken\[[A-Za-z0-9_\-]+\]$").unwrap();
    static ref APNS_TOKEN: Regex = Regex::new(r"^[0-9a-fA-F]{64}$").unwrap();
    static ref FCM_TOKEN: Regex = Regex::new(r"^[A-Za-z0-9_\-]+:[A-Za-z0-9_\-]{100,}$").unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenFormat {
    Expo,
    Apns,
    Fcm,
}

impl TokenFormat {
    pub fn detect(token: &str) -> Option<Self> {
        if EXPO_TOKEN.is_match(token) {
            Some(Self::Expo)
        } else if APNS_TOKEN.is_match(token) {
            Some(Self::Apns)
        } else if FCM_TOKEN.is_match(token) {
            Some(Self::Fcm)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Expo => "expo",
            Self::Apns => "apns",
            Self::Fcm => "fcm",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("title is empty")]
    EmptyTitle,
    #[error("title is {0} characters, limit is 100")]
    TitleTooLong(usize),
    #[error("title contains forbidden character {0:?}")]
    TitleForbiddenChar(char),
    #[error("body is empty")]
    EmptyBody,
    #[error("body is {0} characters, limit is 300")]
    BodyTooLong(usize),
    #[error("body contains forbidden character {0:?}")]
    BodyForbiddenChar(char),
    #[error("recipient token is empty")]
    EmptyToken,
    #[error("recipient token is not a recognised push token")]
    UnrecognisedToken,
    #[error("payload is {0} bytes, limit is 4096")]
    PayloadTooLarge(usize),
    #[error("payload could not be serialized: {0}")]
    PayloadUnserializable(String),
}

// First failing rule wins: title, body, token, payload.
pub fn validate(candidate: &NotificationCandidate) -> Result<(), ValidationError> {
    check_text(
        &candidate.title,
        MAX_TITLE_CHARS,
        ValidationError::EmptyTitle,
        ValidationError::TitleTooLong,
        ValidationError::TitleForbiddenChar,
    )?;
    check_text(
        &candidate.body,
        MAX_BODY_CHARS,
        ValidationError::EmptyBody,
        ValidationError::BodyTooLong,
        ValidationError::BodyForbiddenChar,
    )?;

    if candidate.recipient_token.trim().is_empty() {
        return Err(ValidationError::EmptyToken);
    }
    if TokenFormat::detect(&candidate.recipient_token).is_none() {
        return Err(ValidationError::UnrecognisedToken);
    }

    let size = serde_json::to_vec(&candidate.payload)
        .map_err(|e| ValidationError::PayloadUnserializable(e.to_string()))?
        .len();
    if size > MAX_PAYLOAD_BYTES {
        return Err(ValidationError::PayloadTooLarge(size));
    }

    Ok(())
}

fn check_text(
    text: &str,
    max_chars: usize,
    empty: ValidationError,
    too_long: fn(usize) -> ValidationError,
    forbidden: fn(char) -> ValidationError,
) -> Result<(), ValidationError> {
    if text.trim().is_empty() {
        return Err(empty);
    }
    let len = text.chars().count();
    if len > max_chars {
        return Err(too_long(len));
    }
    if let Some(c) = text.chars().find(|c| FORBIDDEN_CHARS.contains(c)) {
        return Err(forbidden(c));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NotificationKind;
    use crate::testing::{candidate, APNS_TOKEN_SAMPLE, EXPO_TOKEN_SAMPLE};

    #[test]
    fn test_valid_candidate_passes() {
        let c = candidate(NotificationKind::PostLike, "New like", "Sam liked your pasta");
        assert_eq!(validate(&c), Ok(()));
    }

    #[test]
    fn test_validation_is_deterministic() {
        let good = candidate(NotificationKind::PostLike, "New like", "Sam liked your pasta");
        let bad = candidate(NotificationKind::PostLike, "<b>", "Sam liked your pasta");
        assert_eq!(validate(&good), validate(&good));
        assert_eq!(validate(&bad), validate(&bad));
    }

    #[test]
    fn test_title_rules() {
        let c = candidate(NotificationKind::PostLike, "   ", "body");
        assert_eq!(validate(&c), Err(ValidationError::EmptyTitle));

        let c = candidate(NotificationKind::PostLike, &"a".repeat(101), "body");
        assert_eq!(validate(&c), Err(ValidationError::TitleTooLong(101)));

        let c = candidate(NotificationKind::PostLike, &"é".repeat(100), "body");
        assert_eq!(validate(&c), Ok(()));

        let c = candidate(NotificationKind::PostLike, "hi {name}", "body");
        assert_eq!(validate(&c), Err(ValidationError::TitleForbiddenChar('{')));
    }

    #[test]
    fn test_body_rules() {
        let c = candidate(NotificationKind::PostLike, "title", "");
        assert_eq!(validate(&c), Err(ValidationError::EmptyBody));

        let c = candidate(NotificationKind::PostLike, "title", &"b".repeat(301));
        assert_eq!(validate(&c), Err(ValidationError::BodyTooLong(301)));

        let c = candidate(NotificationKind::PostLike, "title", "a > b");
        assert_eq!(validate(&c), Err(ValidationError::BodyForbiddenChar('>')));
    }

    #[test]
    fn test_first_failure_wins() {
        let mut c = candidate(NotificationKind::PostLike, "", "");
        c.recipient_token.clear();
        assert_eq!(validate(&c), Err(ValidationError::EmptyTitle));
    }

    #[test]
    fn test_token_formats() {
        assert_eq!(TokenFormat::detect(EXPO_TOKEN_SAMPLE), Some(TokenFormat::Expo));
        assert_eq!(TokenFormat::detect("ExpoPushToken[xyz-123]"), Some(TokenFormat::Expo));
        assert_eq!(TokenFormat::detect(APNS_TOKEN_SAMPLE), Some(TokenFormat::Apns));
        let fcm = format!("dGVzdA:APA91b{}", "x".repeat(120));
        assert_eq!(TokenFormat::detect(&fcm), Some(TokenFormat::Fcm));
        assert_eq!(TokenFormat::detect("ExponentPushToken[]"), None);
        assert_eq!(TokenFormat::detect("not a token"), None);

        let mut c = candidate(NotificationKind::PostLike, "title", "body");
        c.recipient_token = "garbage".to_string();
        assert_eq!(validate(&c), Err(ValidationError::UnrecognisedToken));
        c.recipient_token = " ".to_string();
        assert_eq!(validate(&c), Err(ValidationError::EmptyToken));
    }

    #[test]
    fn test_payload_size_limit() {
        let c = candidate(NotificationKind::PostLike, "title", "body")
            .with_data("blob", serde_json::Value::String("x".repeat(MAX_PAYLOAD_BYTES)));
        assert!(matches!(validate(&c), Err(ValidationError::PayloadTooLarge(_))));

        let c = candidate(NotificationKind::PostLike, "title", "body")
            .with_data("post_id", serde_json::json!("p-1"));
        assert_eq!(validate(&c), Ok(()));
    }
}
