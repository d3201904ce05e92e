//! Short-lived signed download links for print artifacts.

use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::AuthError;

type HmacSha256 = Hmac<Sha256>;

/// Signs `path` with an expiry so a link handed to the print worker stops
/// working after `ttl`.
#[derive(Clone)]
pub struct DownloadUrlSigner {
    secret: Vec<u8>,
    ttl: Duration,
}

impl std::fmt::Debug for DownloadUrlSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadUrlSigner").field("ttl", &self.ttl).finish()
    }
}

impl DownloadUrlSigner {
    pub fn new(secret: impl AsRef<[u8]>, ttl: Duration) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
            ttl,
        }
    }

    fn signature(&self, path: &str, expires: i64) -> Result<HmacSha256, AuthError> {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).map_err(|_| AuthError::NotConfigured)?;
        mac.update(path.as_bytes());
        mac.update(b":");
        mac.update(expires.to_string().as_bytes());
        Ok(mac)
    }

    /// `base_url` + `path` with `expires` and `sig` query parameters.
    pub fn sign(&self, base_url: &str, path: &str, now: DateTime<Utc>) -> Result<String, AuthError> {
        let expires = (now + self.ttl).timestamp();
        let sig = hex::encode(self.signature(path, expires)?.finalize().into_bytes());
        Ok(format!(
            "{}{}?expires={}&sig={}",
            base_url.trim_end_matches('/'),
            path,
            expires,
            sig
        ))
    }

    pub fn verify(
        &self,
        path: &str,
        expires: i64,
        sig: &str,
        now: DateTime<Utc>,
    ) -> Result<(), AuthError> {
        if now.timestamp() > expires {
            return Err(AuthError::Expired);
        }
        let bytes = hex::decode(sig).map_err(|_| AuthError::Invalid)?;
        self.signature(path, expires)?
            .verify_slice(&bytes)
            .map_err(|_| AuthError::Invalid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query_param<'a>(url: &'a str, key: &str) -> &'a str {
        let query = url.split_once('?').unwrap().1;
        query
            .split('&')
            .find_map(|kv| kv.strip_prefix(&format!("{key}=")))
            .unwrap()
    }

    #[test]
    fn signed_url_verifies_until_expiry() {
        let signer = DownloadUrlSigner::new("k", Duration::minutes(15));
        let now = Utc::now();
        let url = signer.sign("https://print.example/", "/api/print-jobs/abc/pdf", now).unwrap();
        assert!(url.starts_with("https://print.example/api/print-jobs/abc/pdf?expires="));

        let expires: i64 = query_param(&url, "expires").parse().unwrap();
        let sig = query_param(&url, "sig");
        assert_eq!(signer.verify("/api/print-jobs/abc/pdf", expires, sig, now), Ok(()));
        assert_eq!(
            signer.verify("/api/print-jobs/abc/pdf", expires, sig, now + Duration::minutes(16)),
            Err(AuthError::Expired)
        );
        assert_eq!(
            signer.verify("/api/print-jobs/other/pdf", expires, sig, now),
            Err(AuthError::Invalid)
        );
    }
}
