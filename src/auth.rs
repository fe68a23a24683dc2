// ============================================================================
// File: src/auth.rs
// Chat access tokens bound to a paid checkout session
// ============================================================================

use anyhow::{anyhow, Result};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::AdvisorError;

type HmacSha256 = Hmac<Sha256>;

/// Issues and checks `<session_id>.<hex hmac>` tokens.
///
/// Tokens carry no expiry; they stay valid for as long as the secret does.
pub struct ChatTokens {
    key: HmacSha256,
}

impl ChatTokens {
    pub fn new(secret: impl AsRef<[u8]>) -> Result<Self> {
        let key = HmacSha256::new_from_slice(secret.as_ref())
            .map_err(|e| anyhow!("Invalid chat token secret: {}", e))?;
        Ok(Self { key })
    }

    /// Uses the configured secret, or a per-process random one
    pub fn from_secret(secret: Option<&str>) -> Result<Self> {
        match secret.filter(|s| !s.trim().is_empty()) {
            Some(secret) => Self::new(secret),
            None => {
                tracing::warn!("No chat token secret configured; issued tokens will not survive a restart");
                Self::new(uuid::Uuid::new_v4().to_string())
            }
        }
    }

    pub fn issue(&self, session_id: &str) -> String {
        let signature = self.mac(session_id).finalize().into_bytes();
        format!("{}.{}", session_id, hex::encode(signature))
    }

    /// Returns the session id the token was issued for
    pub fn verify(&self, token: &str) -> Result<String, AdvisorError> {
        let invalid = || AdvisorError::Unauthorized("Invalid chat token".to_string());

        let (session_id, signature) = token.rsplit_once('.').ok_or_else(invalid)?;
        if session_id.is_empty() {
            return Err(invalid());
        }
        let signature = hex::decode(signature).map_err(|_| invalid())?;
        self.mac(session_id).verify_slice(&signature).map_err(|_| invalid())?;

        Ok(session_id.to_string())
    }

    fn mac(&self, session_id: &str) -> HmacSha256 {
        let mut mac = self.key.clone();
        mac.update(session_id.as_bytes());
        mac
    }
}
