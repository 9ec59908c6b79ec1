//! Recipient normalization and body checks applied on submission.

use std::sync::LazyLock;

use regex::Regex;
use smsgate_store::BodyEncoding;
use thiserror::Error;

use crate::SubmissionConfig;

#[allow(clippy::unwrap_used, reason = "constant pattern")]
static E164: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\+[1-9][0-9]{6,14}$").unwrap());

/// GSM 03.38 basic character set.
const GSM7_BASIC: &str = "@£$¥èéùìòÇ\nØø\rÅåΔ_ΦΓΛΩΠΨΣΘΞÆæßÉ !\"#¤%&'()*+,-./0123456789:;<=>?\
     ¡ABCDEFGHIJKLMNOPQRSTUVWXYZÄÖÑÜ§¿abcdefghijklmnopqrstuvwxyzäöñüà";

/// GSM 03.38 extension table, reached through the escape code.
const GSM7_EXTENSION: &str = "\u{c}^{}\\[~]|€";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Invalid recipient '{0}': expected an international number such as +33612345678")]
    InvalidRecipient(String),

    #[error("Message body is empty")]
    EmptyBody,

    #[error("Message body is {length} characters, the {encoding} limit is {max}")]
    BodyTooLong {
        length: usize,
        max: usize,
        encoding: &'static str,
    },
}

/// Clean a phone number into E.164 form.
///
/// Everything except digits and `+` is dropped, a leading `0` becomes the
/// default country code and a missing `+` is added.
///
/// # Errors
/// Returns [`ValidationError::InvalidRecipient`] when the cleaned number is
/// not a plausible international number.
pub fn normalize_recipient(
    raw: &str,
    default_country_code: Option<&str>,
) -> Result<String, ValidationError> {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '+')
        .collect();

    let normalized = match (cleaned.strip_prefix('0'), default_country_code) {
        (Some(national), Some(code)) => format!("+{}{national}", code.trim_start_matches('+')),
        _ if cleaned.starts_with('+') => cleaned,
        _ => format!("+{cleaned}"),
    };

    if E164.is_match(&normalized) {
        Ok(normalized)
    } else {
        Err(ValidationError::InvalidRecipient(raw.to_string()))
    }
}

/// Whether `body` can go out as GSM-7, or needs UCS-2.
#[must_use]
pub fn body_encoding(body: &str) -> BodyEncoding {
    if body
        .chars()
        .all(|c| GSM7_BASIC.contains(c) || GSM7_EXTENSION.contains(c))
    {
        BodyEncoding::Gsm7
    } else {
        BodyEncoding::Unicode
    }
}

/// Single-SMS parts `body` occupies: 160 GSM-7 or 70 UCS-2 characters each.
#[must_use]
pub fn parts_count(body: &str, encoding: BodyEncoding) -> u32 {
    let per_part = match encoding {
        BodyEncoding::Gsm7 => 160,
        BodyEncoding::Unicode => 70,
    };
    let parts = body.chars().count().div_ceil(per_part).max(1);
    u32::try_from(parts).unwrap_or(u32::MAX)
}

/// Check the body against the single-SMS limit for its encoding.
///
/// # Errors
/// Returns [`ValidationError::EmptyBody`] or [`ValidationError::BodyTooLong`].
pub fn validate_body(body: &str, config: &SubmissionConfig) -> Result<BodyEncoding, ValidationError> {
    if body.trim().is_empty() {
        return Err(ValidationError::EmptyBody);
    }

    let encoding = body_encoding(body);
    let max = match encoding {
        BodyEncoding::Gsm7 => config.max_gsm_chars,
        BodyEncoding::Unicode => config.max_unicode_chars,
    };
    let length = body.chars().count();
    if length > max {
        return Err(ValidationError::BodyTooLong {
            length,
            max,
            encoding: encoding.as_str(),
        });
    }
    Ok(encoding)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn recipients_are_cleaned_into_e164() {
        assert_eq!(
            normalize_recipient("06 12 34 56 78", Some("33")),
            Ok("+33612345678".to_string())
        );
        assert_eq!(
            normalize_recipient("+44 (20) 7946-0958", Some("33")),
            Ok("+442079460958".to_string())
        );
        assert_eq!(
            normalize_recipient("33612345678", None),
            Ok("+33612345678".to_string())
        );
    }

    #[test]
    fn implausible_recipients_are_rejected() {
        for raw in ["", "+0612345678", "12345", "+1234567890123456", "0612345678"] {
            assert_eq!(
                normalize_recipient(raw, None),
                Err(ValidationError::InvalidRecipient(raw.to_string())),
                "{raw}"
            );
        }
    }

    #[test]
    fn parts_follow_the_encoding() {
        assert_eq!(parts_count("", BodyEncoding::Gsm7), 1);
        assert_eq!(parts_count(&"a".repeat(160), BodyEncoding::Gsm7), 1);
        assert_eq!(parts_count(&"a".repeat(161), BodyEncoding::Gsm7), 2);
        assert_eq!(parts_count(&"é".repeat(71), BodyEncoding::Unicode), 2);
    }

    #[test]
    fn encoding_detection() {
        assert_eq!(body_encoding("Rendez-vous à 10h, ça marche?"), BodyEncoding::Unicode);
        assert_eq!(body_encoding("Prix: 5€ [promo] {ok}"), BodyEncoding::Gsm7);
        assert_eq!(body_encoding("Ünïcode"), BodyEncoding::Unicode);
        assert_eq!(body_encoding("Grüße"), BodyEncoding::Gsm7);
        assert_eq!(body_encoding("hi 👋"), BodyEncoding::Unicode);
    }

    #[test]
    fn body_limits_depend_on_encoding() {
        let config = SubmissionConfig::default();

        assert_eq!(validate_body(&"a".repeat(160), &config), Ok(BodyEncoding::Gsm7));
        assert!(matches!(
            validate_body(&"a".repeat(161), &config),
            Err(ValidationError::BodyTooLong { max: 160, .. })
        ));
        assert!(matches!(
            validate_body(&"я".repeat(71), &config),
            Err(ValidationError::BodyTooLong {
                length: 71,
                max: 70,
                encoding: "unicode"
            })
        ));
        assert_eq!(validate_body("   \n", &config), Err(ValidationError::EmptyBody));
    }
}
