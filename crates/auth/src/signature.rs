//! Payment-provider webhook signatures.
//!
//! Header format: `t=<unix seconds>,v1=<hex>[,v1=<hex>...]` where each `v1` is
//! `HMAC-SHA256(secret, "<t>.<raw body>")`. Several `v1` entries appear while
//! the provider rotates secrets; any one matching is enough.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::AuthError;

type HmacSha256 = Hmac<Sha256>;

/// Default allowed clock skew between signing and receipt.
pub const DEFAULT_TOLERANCE_SECS: i64 = 300;

#[derive(Clone)]
pub struct WebhookSignatureVerifier {
    secret: Option<String>,
    tolerance_secs: i64,
}

impl std::fmt::Debug for WebhookSignatureVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookSignatureVerifier")
            .field("configured", &self.is_configured())
            .field("tolerance_secs", &self.tolerance_secs)
            .finish()
    }
}

struct ParsedHeader<'a> {
    timestamp: i64,
    signatures: Vec<&'a str>,
}

fn parse_header(header: &str) -> Result<ParsedHeader<'_>, AuthError> {
    let mut timestamp = None;
    let mut signatures = Vec::new();

    for part in header.split(',') {
        let (key, value) = part
            .trim()
            .split_once('=')
            .ok_or_else(|| AuthError::MalformedHeader(format!("bad segment: {part}")))?;
        match key {
            "t" => {
                let ts = value
                    .parse::<i64>()
                    .map_err(|_| AuthError::MalformedHeader("timestamp is not an integer".into()))?;
                timestamp = Some(ts);
            }
            "v1" => signatures.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or_else(|| AuthError::MalformedHeader("missing t".into()))?;
    if signatures.is_empty() {
        return Err(AuthError::MalformedHeader("missing v1".into()));
    }
    Ok(ParsedHeader {
        timestamp,
        signatures,
    })
}

impl WebhookSignatureVerifier {
    pub fn new(secret: Option<String>, tolerance_secs: i64) -> Self {
        let secret = secret.filter(|s| !s.trim().is_empty());
        Self {
            secret,
            tolerance_secs,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.secret.is_some()
    }

    fn mac(&self, timestamp: i64, payload: &[u8]) -> Result<HmacSha256, AuthError> {
        let secret = self.secret.as_ref().ok_or(AuthError::NotConfigured)?;
        let mut mac =
            HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| AuthError::NotConfigured)?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        Ok(mac)
    }

    /// Verify `header` against the raw request body.
    pub fn verify(
        &self,
        payload: &[u8],
        header: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), AuthError> {
        if !self.is_configured() {
            return Err(AuthError::NotConfigured);
        }
        let header = header.ok_or(AuthError::Missing)?;
        let parsed = parse_header(header)?;

        let tolerance = u64::try_from(self.tolerance_secs).unwrap_or(0);
        if now.timestamp().abs_diff(parsed.timestamp) > tolerance {
            return Err(AuthError::Expired);
        }

        for candidate in parsed.signatures {
            let Ok(bytes) = hex::decode(candidate) else {
                continue;
            };
            // verify_slice compares in constant time.
            if self.mac(parsed.timestamp, payload)?.verify_slice(&bytes).is_ok() {
                return Ok(());
            }
        }
        Err(AuthError::Invalid)
    }

    /// Produce a header value for `payload` signed at `at` (test fixtures, replay tools).
    pub fn sign(&self, payload: &[u8], at: DateTime<Utc>) -> Result<String, AuthError> {
        let timestamp = at.timestamp();
        let digest = self.mac(timestamp, payload)?.finalize().into_bytes();
        Ok(format!("t={},v1={}", timestamp, hex::encode(digest)))
    }
}
