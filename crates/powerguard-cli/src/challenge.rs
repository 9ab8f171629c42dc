use std::sync::Mutex;

use futures::future::BoxFuture;
use powerguard_core::auth::AuthChallenge;
use powerguard_core::error::AuthError;
use sha2::{Digest, Sha256};
use tracing::debug;

/// Lower-case hex SHA-256 of a passphrase, as stored in the config.
pub fn passphrase_digest(passphrase: &str) -> String {
    format!("{:x}", Sha256::digest(passphrase.as_bytes()))
}

/// Password-fallback challenge for headless sessions.
///
/// The command loop offers the passphrase typed with a command just before
/// the request; the challenge consumes it. No offer reads as the user
/// dismissing the prompt.
pub struct PassphraseChallenge {
    digest: Option<String>,
    offered: Mutex<Option<String>>,
}

impl PassphraseChallenge {
    pub fn new(digest: Option<String>) -> Self {
        Self {
            digest: digest.map(|d| d.to_ascii_lowercase()),
            offered: Mutex::new(None),
        }
    }

    pub fn offer(&self, passphrase: Option<String>) {
        *self
            .offered
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = passphrase;
    }

    fn take_offer(&self) -> Option<String> {
        self.offered
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
    }

    fn check(&self, allow_fallback: bool) -> Result<(), AuthError> {
        let offered = self.take_offer();
        if !allow_fallback {
            return Err(AuthError::Unavailable);
        }
        let expected = self.digest.as_deref().ok_or(AuthError::NoPasscode)?;
        let offered = offered.ok_or(AuthError::UserCancelled)?;
        if passphrase_digest(&offered) == expected {
            Ok(())
        } else {
            Err(AuthError::Failed)
        }
    }
}

impl AuthChallenge for PassphraseChallenge {
    fn evaluate<'a>(
        &'a self,
        reason: &'a str,
        allow_fallback: bool,
    ) -> BoxFuture<'a, Result<(), AuthError>> {
        Box::pin(async move {
            debug!(reason, "passphrase challenge");
            self.check(allow_fallback)
        })
    }
}
