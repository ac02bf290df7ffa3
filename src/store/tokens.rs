use anyhow::Result;
use time::OffsetDateTime;

use crate::model::{TokenRecord, format_ts, parse_ts};
use crate::tokens::TokenError;

use super::EngineStore;

impl EngineStore {
    /// Inserts a freshly issued token. Returns `false` without touching
    /// state if a token with the same hash already exists.
    pub fn insert_token(&self, record: TokenRecord) -> Result<bool> {
        let mut st = self.state();
        if st.tokens.contains_key(&record.token_hash) {
            return Ok(false);
        }
        st.tokens.insert(record.token_hash.clone(), record);
        self.persist_tokens(&st)?;
        Ok(true)
    }

    pub fn find_token(&self, token_hash: &str) -> Option<TokenRecord> {
        self.state().tokens.get(token_hash).cloned()
    }

    /// The redemption check-and-set. Exactly one caller can move a token to
    /// `redeemed` under any interleaving; later callers observe
    /// `AlreadyRedeemed`. The claim is only visible once it is on disk.
    pub fn claim_token(
        &self,
        token_hash: &str,
        subject_id: &str,
        now: OffsetDateTime,
    ) -> Result<TokenRecord, TokenError> {
        let mut st = self.state();

        let claimed = {
            let Some(record) = st.tokens.get_mut(token_hash) else {
                return Err(TokenError::NotFound);
            };
            if record.redeemed {
                return Err(TokenError::AlreadyRedeemed);
            }
            if record.is_expired_at(now)? {
                return Err(TokenError::Expired);
            }
            record.redeemed = true;
            record.redeemed_by = Some(subject_id.to_string());
            record.redeemed_at = Some(format_ts(now));
            record.clone()
        };

        if let Err(err) = self.persist_tokens(&st) {
            if let Some(record) = st.tokens.get_mut(token_hash) {
                record.redeemed = false;
                record.redeemed_by = None;
                record.redeemed_at = None;
            }
            return Err(err.into());
        }
        Ok(claimed)
    }

    /// Rolls back a claim whose activation failed, making the token
    /// redeemable again.
    pub fn release_token(&self, token_hash: &str) -> Result<()> {
        let mut st = self.state();
        if let Some(record) = st.tokens.get_mut(token_hash) {
            record.redeemed = false;
            record.redeemed_by = None;
            record.redeemed_at = None;
        }
        self.persist_tokens(&st)
    }

    /// Moves expired, never-redeemed tokens whose expiry is older than the
    /// retention window into the archive file. Returns the archived count.
    pub fn archive_stale_tokens(
        &self,
        now: OffsetDateTime,
        retention: time::Duration,
    ) -> Result<usize> {
        let cutoff = now - retention;
        let mut st = self.state();

        let mut stale_keys = Vec::new();
        for (key, token) in &st.tokens {
            if token.redeemed {
                continue;
            }
            if parse_ts(&token.expires_at)? <= cutoff {
                stale_keys.push(key.clone());
            }
        }
        if stale_keys.is_empty() {
            return Ok(0);
        }

        let mut stale = Vec::with_capacity(stale_keys.len());
        for key in stale_keys {
            if let Some(token) = st.tokens.remove(&key) {
                stale.push(token);
            }
        }
        stale.sort_by(|a, b| a.issued_at.cmp(&b.issued_at).then_with(|| a.id.cmp(&b.id)));

        self.append_token_archive(&stale)?;
        self.persist_tokens(&st)?;
        Ok(stale.len())
    }
}
