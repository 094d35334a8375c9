//! Server-side state that survives the round trip through the IdP.
//!
//! The RelayState sent to the IdP is the request ID, and the context saved
//! under it is consumed exactly once when the IdP answers. Login contexts are
//! also bound to the browser that started them through a nonce the browser
//! keeps in a cookie; only its digest is stored.

use dashmap::{mapref::entry::Entry, DashMap};
use sha2::{Digest, Sha256};
use time::{Duration, OffsetDateTime};

use crate::{
    redirect_guard::SafeRedirect, session::SessionId, utils::random_string, StoreError,
    ValidationFailure,
};

const BROWSER_NONCE_LEN: usize = 32;

pub fn new_browser_nonce() -> String {
    random_string(BROWSER_NONCE_LEN)
}

fn nonce_digest(nonce: &str) -> String {
    hex::encode(Sha256::digest(nonce.as_bytes()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrowserBinding {
    nonce_digest: String,
    /// Session the browser had when it started the login, if any.
    started_by: Option<SessionId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Login,
    Logout,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthnRequestContext {
    pub request_id: String,
    pub idp_key: String,
    pub kind: RequestKind,
    pub return_to: SafeRedirect,
    pub created_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
    pub browser: Option<BrowserBinding>,
}

impl AuthnRequestContext {
    pub fn new(
        request_id: impl Into<String>,
        idp_key: impl Into<String>,
        kind: RequestKind,
        return_to: SafeRedirect,
        now: OffsetDateTime,
        ttl: Duration,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            idp_key: idp_key.into(),
            kind,
            return_to,
            created_at: now,
            expires_at: now + ttl,
            browser: None,
        }
    }

    pub fn bound_to_browser(self, nonce: &str, started_by: Option<SessionId>) -> Self {
        Self {
            browser: Some(BrowserBinding {
                nonce_digest: nonce_digest(nonce),
                started_by,
            }),
            ..self
        }
    }

    /// Unbound contexts accept any browser; bound ones only the nonce they
    /// were created with.
    pub fn accepts_browser(&self, nonce: Option<&str>) -> bool {
        match &self.browser {
            None => true,
            Some(binding) => nonce.is_some_and(|nonce| nonce_digest(nonce) == binding.nonce_digest),
        }
    }

    pub fn started_by(&self) -> Option<&SessionId> {
        self.browser
            .as_ref()
            .and_then(|binding| binding.started_by.as_ref())
    }

    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        now >= self.expires_at
    }
}

pub trait RequestStateStore: Send + Sync {
    /// Fails if a context is already stored under the same request ID.
    fn save(&self, context: AuthnRequestContext) -> Result<(), StoreError>;

    /// Removes and returns the context. Expired contexts are removed too but
    /// reported as absent. Of several concurrent callers at most one gets it.
    fn consume(
        &self,
        request_id: &str,
        now: OffsetDateTime,
    ) -> Result<Option<AuthnRequestContext>, StoreError>;

    fn purge_expired(&self, now: OffsetDateTime) -> Result<usize, StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryStateStore {
    contexts: DashMap<String, AuthnRequestContext>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }
}

impl RequestStateStore for MemoryStateStore {
    fn save(&self, context: AuthnRequestContext) -> Result<(), StoreError> {
        match self.contexts.entry(context.request_id.clone()) {
            Entry::Occupied(_) => Err(StoreError(format!(
                "duplicate request id {}",
                context.request_id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(context);
                Ok(())
            }
        }
    }

    fn consume(
        &self,
        request_id: &str,
        now: OffsetDateTime,
    ) -> Result<Option<AuthnRequestContext>, StoreError> {
        Ok(self
            .contexts
            .remove(request_id)
            .map(|(_, context)| context)
            .filter(|context| !context.is_expired(now)))
    }

    fn purge_expired(&self, now: OffsetDateTime) -> Result<usize, StoreError> {
        let before = self.contexts.len();
        self.contexts.retain(|_, context| !context.is_expired(now));
        Ok(before.saturating_sub(self.contexts.len()))
    }
}

/// Assertion IDs seen recently, each remembered until the assertion itself
/// would have expired.
#[derive(Debug, Default)]
pub struct AssertionReplayCache {
    seen: DashMap<String, OffsetDateTime>,
}

impl AssertionReplayCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check_and_record(
        &self,
        assertion_id: &str,
        remember_until: OffsetDateTime,
        now: OffsetDateTime,
    ) -> Result<(), ValidationFailure> {
        match self.seen.entry(assertion_id.to_string()) {
            Entry::Occupied(mut entry) => {
                if *entry.get() > now {
                    return Err(ValidationFailure::Replayed);
                }
                entry.insert(remember_until);
            }
            Entry::Vacant(slot) => {
                slot.insert(remember_until);
            }
        }
        Ok(())
    }

    pub fn purge_expired(&self, now: OffsetDateTime) -> usize {
        let before = self.seen.len();
        self.seen.retain(|_, until| *until > now);
        before.saturating_sub(self.seen.len())
    }
}
