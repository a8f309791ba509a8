//! Capability token verification.
//!
//! A token is a public id plus a secret. Only the SHA-256 of the secret is
//! stored; verification hashes the presented secret and compares the digests
//! in constant time.

pub mod limiter;

use anyhow::Result;
use chrono::Utc;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use subtle::ConstantTimeEq;

use crate::database::{Database, TokenScope};
use crate::error::AuthError;

pub use limiter::AuthFailureLimiter;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    pub principal: i64,
    pub token_id: String,
    pub scope: TokenScope,
}

impl AuthContext {
    /// Whether this credential may start work for an episode in `feed_id`.
    pub fn can_trigger(&self, feed_id: i64) -> bool {
        self.scope == TokenScope::FeedScoped(feed_id)
    }

    /// Read access: the feed's own token or a combined one.
    pub fn can_read(&self, feed_id: i64) -> bool {
        match self.scope {
            TokenScope::FeedScoped(id) => id == feed_id,
            TokenScope::Combined => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    Authorized(AuthContext),
    Unauthorized,
}

impl AuthOutcome {
    pub fn context(&self) -> Option<&AuthContext> {
        match self {
            AuthOutcome::Authorized(ctx) => Some(ctx),
            AuthOutcome::Unauthorized => None,
        }
    }
}

/// A freshly issued credential. The secret is not recoverable afterwards.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token_id: String,
    pub secret: String,
}

pub struct Authorizer {
    db: Arc<Database>,
}

impl Authorizer {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn authenticate(
        &self,
        token_id: Option<&str>,
        secret: Option<&str>,
    ) -> Result<AuthContext, AuthError> {
        let (token_id, secret) = match (token_id, secret) {
            (Some(id), Some(secret)) if !id.is_empty() && !secret.is_empty() => (id, secret),
            _ => return Err(AuthError::MissingCredentials),
        };

        let token = self
            .db
            .get_token(token_id)?
            .ok_or(AuthError::UnknownToken)?;
        if token.revoked {
            return Err(AuthError::Revoked);
        }
        if !digests_match(&hash_secret(secret), &token.token_hash) {
            return Err(AuthError::SecretMismatch);
        }

        if let Err(e) = self.db.touch_token(&token.token_id, Utc::now()) {
            log::warn!("Failed to record token use for {}: {}", token.token_id, e);
        }

        Ok(AuthContext {
            principal: token.principal,
            token_id: token.token_id,
            scope: token.scope,
        })
    }

    /// Resolve credentials to an outcome. Only store failures are errors.
    pub fn resolve(
        &self,
        token_id: Option<&str>,
        secret: Option<&str>,
    ) -> Result<AuthOutcome, AuthError> {
        match self.authenticate(token_id, secret) {
            Ok(ctx) => Ok(AuthOutcome::Authorized(ctx)),
            Err(AuthError::Store(e)) => Err(AuthError::Store(e)),
            Err(e) => {
                log::debug!("Credential rejected: {}", e);
                Ok(AuthOutcome::Unauthorized)
            }
        }
    }

    /// Issue (or rotate) the single live token for `(principal, scope)`.
    pub fn issue_token(&self, principal: i64, scope: TokenScope) -> Result<IssuedToken> {
        let candidate_id = random_hex(16);
        let secret = random_hex(32);
        let token_id =
            self.db
                .upsert_token(principal, scope.feed_id(), &candidate_id, &hash_secret(&secret))?;
        log::info!(
            "Issued token {} for principal {} ({:?})",
            token_id,
            principal,
            scope
        );
        Ok(IssuedToken { token_id, secret })
    }
}

pub fn hash_secret(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}

pub fn digests_match(presented: &str, stored: &str) -> bool {
    presented.as_bytes().ct_eq(stored.as_bytes()).into()
}

fn random_hex(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (Authorizer, Arc<Database>, TempDir, i64) {
        let temp = TempDir::new().unwrap();
        let db = Arc::new(Database::new(&temp.path().join("test.db")).unwrap());
        let feed_id = db.insert_feed("Feed", false).unwrap();
        (Authorizer::new(db.clone()), db, temp, feed_id)
    }

    #[test]
    fn test_issue_and_authenticate_feed_token() {
        let (auth, db, _temp, feed_id) = setup();
        let issued = auth.issue_token(42, TokenScope::FeedScoped(feed_id)).unwrap();

        let ctx = auth
            .authenticate(Some(&issued.token_id), Some(&issued.secret))
            .unwrap();
        assert_eq!(ctx.principal, 42);
        assert_eq!(ctx.scope, TokenScope::FeedScoped(feed_id));
        assert!(ctx.can_trigger(feed_id));
        assert!(!ctx.can_trigger(feed_id + 1));

        let stored = db.get_token(&issued.token_id).unwrap().unwrap();
        assert!(stored.last_used_at.is_some());
        assert_ne!(stored.token_hash, issued.secret);
    }

    #[test]
    fn test_combined_token_never_triggers() {
        let (auth, _db, _temp, feed_id) = setup();
        let issued = auth.issue_token(42, TokenScope::Combined).unwrap();
        let ctx = auth
            .authenticate(Some(&issued.token_id), Some(&issued.secret))
            .unwrap();
        assert_eq!(ctx.scope, TokenScope::Combined);
        assert!(!ctx.can_trigger(feed_id));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let (auth, _db, _temp, feed_id) = setup();
        let issued = auth.issue_token(1, TokenScope::FeedScoped(feed_id)).unwrap();
        let err = auth
            .authenticate(Some(&issued.token_id), Some("not-the-secret"))
            .unwrap_err();
        assert!(matches!(err, AuthError::SecretMismatch));

        let outcome = auth.resolve(Some(&issued.token_id), Some("nope")).unwrap();
        assert_eq!(outcome, AuthOutcome::Unauthorized);
    }

    #[test]
    fn test_missing_and_unknown_credentials() {
        let (auth, _db, _temp, _feed_id) = setup();
        assert!(matches!(
            auth.authenticate(None, Some("x")),
            Err(AuthError::MissingCredentials)
        ));
        assert!(matches!(
            auth.authenticate(Some(""), Some("x")),
            Err(AuthError::MissingCredentials)
        ));
        assert!(matches!(
            auth.authenticate(Some("nope"), Some("x")),
            Err(AuthError::UnknownToken)
        ));
    }

    #[test]
    fn test_revoked_token_rejected() {
        let (auth, db, _temp, feed_id) = setup();
        let issued = auth.issue_token(1, TokenScope::FeedScoped(feed_id)).unwrap();
        db.revoke_token(&issued.token_id).unwrap();
        assert!(matches!(
            auth.authenticate(Some(&issued.token_id), Some(&issued.secret)),
            Err(AuthError::Revoked)
        ));
    }

    #[test]
    fn test_reissue_rotates_secret_for_same_pair() {
        let (auth, _db, _temp, feed_id) = setup();
        let first = auth.issue_token(1, TokenScope::FeedScoped(feed_id)).unwrap();
        let second = auth.issue_token(1, TokenScope::FeedScoped(feed_id)).unwrap();
        assert_eq!(first.token_id, second.token_id);
        assert_ne!(first.secret, second.secret);

        assert!(auth
            .authenticate(Some(&first.token_id), Some(&first.secret))
            .is_err());
        assert!(auth
            .authenticate(Some(&second.token_id), Some(&second.secret))
            .is_ok());
    }

    #[test]
    fn test_hash_secret_is_sha256_hex() {
        assert_eq!(
            hash_secret("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert!(digests_match(&hash_secret("abc"), &hash_secret("abc")));
        assert!(!digests_match(&hash_secret("abc"), &hash_secret("abd")));
    }
}
