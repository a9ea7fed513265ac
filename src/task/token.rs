//! Signed download tokens.
//!
//! A token binds (task id, artifact, expiry) under an HMAC so the download
//! endpoint can be served by a separate component without re-authenticating.
//! Tokens are opaque, URL-safe and scoped to a single artifact.

use crate::task::ArtifactKind;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::Duration;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenVerification {
    Valid {
        task_id: String,
        artifact: ArtifactKind,
    },
    Expired,
    Mismatch,
}

pub struct DownloadGuard {
    secret: Vec<u8>,
}

impl DownloadGuard {
    pub fn new(secret: &str) -> Self {
        Self {
            secret: secret.as_bytes().to_vec(),
        }
    }

    /// Guard with a process-local random secret; tokens do not survive a
    /// restart, which matches the in-memory task registry.
    pub fn ephemeral() -> Self {
        let secret = format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple());
        Self::new(&secret)
    }

    pub fn issue(&self, task_id: &str, artifact: ArtifactKind, ttl: Duration) -> String {
        let expires = chrono::Utc::now().timestamp() + ttl.as_secs() as i64;
        let payload = format!("{task_id}:{}:{expires}", artifact.as_str());
        let signature = self.sign(&payload);
        format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(payload.as_bytes()),
            URL_SAFE_NO_PAD.encode(signature)
        )
    }

    pub fn verify(&self, token: &str) -> TokenVerification {
        let Some((payload_b64, signature_b64)) = token.split_once('.') else {
            return TokenVerification::Mismatch;
        };
        let (Ok(payload), Ok(signature)) = (
            URL_SAFE_NO_PAD.decode(payload_b64),
            URL_SAFE_NO_PAD.decode(signature_b64),
        ) else {
            return TokenVerification::Mismatch;
        };
        let Ok(payload) = String::from_utf8(payload) else {
            return TokenVerification::Mismatch;
        };

        let mut mac = HmacSha256::new_from_slice(&self.secret).expect("hmac accepts any key size");
        mac.update(payload.as_bytes());
        if mac.verify_slice(&signature).is_err() {
            return TokenVerification::Mismatch;
        }

        let mut parts = payload.rsplitn(3, ':');
        let (Some(expires), Some(artifact), Some(task_id)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return TokenVerification::Mismatch;
        };
        let Ok(expires) = expires.parse::<i64>() else {
            return TokenVerification::Mismatch;
        };
        let Ok(artifact) = artifact.parse::<ArtifactKind>() else {
            return TokenVerification::Mismatch;
        };

        if chrono::Utc::now().timestamp() > expires {
            return TokenVerification::Expired;
        }

        TokenVerification::Valid {
            task_id: task_id.to_string(),
            artifact,
        }
    }

    /// Check a token against the task and artifact it is being redeemed
    /// for.
    pub fn verify_for(
        &self,
        token: &str,
        task_id: &str,
        artifact: ArtifactKind,
    ) -> TokenVerification {
        match self.verify(token) {
            TokenVerification::Valid {
                task_id: token_task,
                artifact: token_artifact,
            } if token_task == task_id && token_artifact == artifact => TokenVerification::Valid {
                task_id: token_task,
                artifact: token_artifact,
            },
            TokenVerification::Expired => TokenVerification::Expired,
            _ => TokenVerification::Mismatch,
        }
    }

    fn sign(&self, payload: &str) -> Vec<u8> {
        let mut mac = HmacSha256::new_from_slice(&self.secret).expect("hmac accepts any key size");
        mac.update(payload.as_bytes());
        mac.finalize().into_bytes().to_vec()
    }
}
