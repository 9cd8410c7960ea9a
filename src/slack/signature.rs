//! Slack request signing: `v0=` + hex HMAC-SHA256 of `v0:{timestamp}:{body}`.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Requests older than this are replays
pub const MAX_AGE_SECS: i64 = 60 * 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    #[error("missing or malformed Slack timestamp")]
    BadTimestamp,
    #[error("Slack request is too old")]
    Expired,
    #[error("invalid Slack signature")]
    Mismatch,
}

pub fn sign(secret: &str, timestamp: &str, body: &[u8]) -> String {
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => unreachable!("HMAC accepts any key length"),
    };
    mac.update(b"v0:");
    mac.update(timestamp.as_bytes());
    mac.update(b":");
    mac.update(body);
    format!("v0={}", hex::encode(mac.finalize().into_bytes()))
}

/// Check a request against the signing secret at time `now` (unix seconds)
pub fn verify(
    secret: &str,
    timestamp: &str,
    signature: &str,
    body: &[u8],
    now: i64,
) -> Result<(), SignatureError> {
    let sent_at: i64 = timestamp.parse().map_err(|_| SignatureError::BadTimestamp)?;
    if now.abs_diff(sent_at) > MAX_AGE_SECS.unsigned_abs() {
        return Err(SignatureError::Expired);
    }

    let expected = sign(secret, timestamp, body);
    if expected.as_bytes().ct_eq(signature.as_bytes()).into() {
        Ok(())
    } else {
        Err(SignatureError::Mismatch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "8f742231b10e8888abcd99yyyzzz85a5";
    const NOW: i64 = 1_531_420_618;
    const BODY: &[u8] = b"token=xyzz0WbapA4vBCDEFasx0q6G&team_id=T1DC2JH3J&command=%2Fcfa-link&text=abc";

    #[test]
    fn test_valid_signature() {
        let signature = sign(SECRET, "1531420618", BODY);
        assert!(signature.starts_with("v0="));
        assert_eq!(verify(SECRET, "1531420618", &signature, BODY, NOW), Ok(()));
    }

    #[test]
    fn test_tampered_body() {
        let signature = sign(SECRET, "1531420618", BODY);
        assert_eq!(
            verify(SECRET, "1531420618", &signature, b"text=other", NOW),
            Err(SignatureError::Mismatch)
        );
        assert_eq!(
            verify("wrong-secret", "1531420618", &signature, BODY, NOW),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn test_replay_window() {
        let stale = (NOW - MAX_AGE_SECS - 1).to_string();
        let signature = sign(SECRET, &stale, BODY);
        assert_eq!(verify(SECRET, &stale, &signature, BODY, NOW), Err(SignatureError::Expired));

        let edge = (NOW - MAX_AGE_SECS).to_string();
        let signature = sign(SECRET, &edge, BODY);
        assert_eq!(verify(SECRET, &edge, &signature, BODY, NOW), Ok(()));
    }

    #[test]
    fn test_extreme_timestamps_are_expired() {
        for stamp in [i64::MIN, i64::MAX] {
            let stamp = stamp.to_string();
            assert_eq!(
                verify(SECRET, &stamp, "v0=00", BODY, NOW),
                Err(SignatureError::Expired),
                "timestamp {}",
                stamp
            );
        }
    }

    #[test]
    fn test_garbage_timestamp() {
        assert_eq!(
            verify(SECRET, "yesterday", "v0=00", BODY, NOW),
            Err(SignatureError::BadTimestamp)
        );
    }
}
