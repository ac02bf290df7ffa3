use std::sync::Arc;

use anyhow::Result;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{error, info};

use crate::clock::Clock;
use crate::config::ConfigProvider;
use crate::ledger::{LedgerError, MembershipLedger};
use crate::model::{MembershipRecord, TokenRecord, compute_token_id, format_ts};
use crate::store::EngineStore;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("token duration must be positive")]
    InvalidDuration,

    #[error("token not found")]
    NotFound,

    #[error("token already redeemed")]
    AlreadyRedeemed,

    #[error("token expired")]
    Expired,

    #[error("subject already holds an active membership")]
    SubjectAlreadyActive,

    /// Freshly generated token hashes an existing one. Indicates a broken
    /// randomness source, not normal operation.
    #[error("token value collision")]
    ValueCollision,

    #[error("membership activation failed: {0}")]
    Activation(#[source] LedgerError),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// A newly issued token. The secret is returned exactly once and only its
/// hash is persisted.
#[derive(Clone, Debug)]
pub struct IssuedToken {
    pub secret: String,
    pub record: TokenRecord,
}

/// Issues, validates, and redeems single-use time-limited tokens.
#[derive(Clone)]
pub struct TokenRegistry {
    store: Arc<EngineStore>,
    clock: Arc<dyn Clock>,
    config: Arc<dyn ConfigProvider>,
    ledger: MembershipLedger,
}

impl TokenRegistry {
    pub fn new(
        store: Arc<EngineStore>,
        clock: Arc<dyn Clock>,
        config: Arc<dyn ConfigProvider>,
        ledger: MembershipLedger,
    ) -> Self {
        Self {
            store,
            clock,
            config,
            ledger,
        }
    }

    /// Issues a new token valid for `duration` (config default when `None`).
    pub fn issue(
        &self,
        issued_by: &str,
        duration: Option<time::Duration>,
        plan: Option<&str>,
    ) -> Result<IssuedToken, TokenError> {
        let cfg = self.config.current()?;
        let duration = duration.unwrap_or_else(|| cfg.default_token_duration());
        if !duration.is_positive() {
            return Err(TokenError::InvalidDuration);
        }

        let secret = generate_token_secret()?;
        let token_hash = hash_token(&secret);

        let now = self.clock.now();
        let issued_at = format_ts(now);
        let record = TokenRecord {
            id: compute_token_id(issued_by, &token_hash, &issued_at),
            token_hash: token_hash.clone(),
            issued_by: issued_by.to_string(),
            issued_at,
            valid_for_secs: duration.whole_seconds() as u64,
            expires_at: format_ts(now + duration),
            plan: plan.map(str::to_string),
            redeemed: false,
            redeemed_by: None,
            redeemed_at: None,
        };

        if !self.store.insert_token(record.clone())? {
            error!(token_id = %record.id, "token hash collision on issue");
            return Err(TokenError::ValueCollision);
        }

        info!(token_id = %record.id, issued_by, "token issued");
        Ok(IssuedToken { secret, record })
    }

    /// Read-only redemption check; mutates nothing.
    pub fn validate(&self, secret: &str) -> Result<TokenRecord, TokenError> {
        let record = self
            .store
            .find_token(&hash_token(secret))
            .ok_or(TokenError::NotFound)?;
        if record.redeemed {
            return Err(TokenError::AlreadyRedeemed);
        }
        if record.is_expired_at(self.clock.now())? {
            return Err(TokenError::Expired);
        }
        Ok(record)
    }

    /// Redeems a token for `subject_id`, activating (or, with renewal
    /// stacking, extending) a membership lasting the token's duration.
    ///
    /// The claim is a single check-and-set: under concurrent redemption of
    /// the same token exactly one caller succeeds and the rest observe
    /// `AlreadyRedeemed`. A failed activation releases the claim, so the
    /// token is consumed only when a membership came out of it.
    pub fn redeem(&self, secret: &str, subject_id: &str) -> Result<MembershipRecord, TokenError> {
        let cfg = self.config.current()?;
        let token_hash = hash_token(secret);

        let token = self
            .store
            .claim_token(&token_hash, subject_id, self.clock.now())?;

        let duration = time::Duration::seconds(token.valid_for_secs as i64);
        let activation = self.ledger.activate_with_policy(
            subject_id,
            Some(&token.id),
            duration,
            !cfg.stack_renewals,
        );

        match activation {
            Ok(membership) => {
                info!(token_id = %token.id, subject_id, "token redeemed");
                Ok(membership)
            }
            Err(err) => {
                if let Err(release_err) = self.store.release_token(&token_hash) {
                    error!(token_id = %token.id, "failed to release claimed token: {release_err:#}");
                }
                match err {
                    LedgerError::AlreadyActive => Err(TokenError::SubjectAlreadyActive),
                    other => Err(TokenError::Activation(other)),
                }
            }
        }
    }

    /// Daily retention pass: archives expired, never-redeemed tokens older
    /// than the retention window.
    pub fn archive_stale(&self, now: OffsetDateTime, retention: time::Duration) -> Result<usize> {
        self.store.archive_stale_tokens(now, retention)
    }
}

pub fn hash_token(secret: &str) -> String {
    blake3::hash(secret.as_bytes()).to_hex().to_string()
}

/// 32 bytes of entropy, hex-encoded.
fn generate_token_secret() -> Result<String> {
    let mut bytes = [0u8; 32];
    getrandom::getrandom(&mut bytes).map_err(|e| anyhow::anyhow!("getrandom: {:?}", e))?;
    let mut out = String::with_capacity(64);
    for b in &bytes {
        out.push_str(&format!("{:02x}", b));
    }
    Ok(out)
}
