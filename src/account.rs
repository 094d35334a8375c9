//! Local accounts and their links to federated identities.

use std::{
    collections::{BTreeMap, HashMap},
    fmt::Display,
    sync::{Mutex, MutexGuard},
};

use time::OffsetDateTime;

use crate::StoreError;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AccountId(pub String);

impl Display for AccountId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AccountId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Profile of an account created on first login.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct NewAccount {
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub username: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub id: AccountId,
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub username: Option<String>,
}

/// A federated identity is the NameID as asserted by one configured IdP.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LinkKey {
    pub idp_key: String,
    pub name_id: String,
}

impl LinkKey {
    pub fn new(idp_key: impl Into<String>, name_id: impl Into<String>) -> Self {
        Self {
            idp_key: idp_key.into(),
            name_id: name_id.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountLink {
    pub key: LinkKey,
    pub account_id: AccountId,
    pub idp_entity_id: String,
    pub linked_at: OffsetDateTime,
}

/// Result of an insert-if-absent link write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkOutcome {
    Created(AccountId),
    /// The key was already linked; carries the account that holds it.
    Existing(AccountId),
}

impl LinkOutcome {
    pub fn account_id(&self) -> &AccountId {
        match self {
            LinkOutcome::Created(id) | LinkOutcome::Existing(id) => id,
        }
    }
}

/// Persistence owned by the embedding application.
///
/// Link writes must be insert-if-absent: two concurrent writers for the same
/// [`LinkKey`] end with exactly one link, and the loser learns the winner.
pub trait AccountStore: Send + Sync {
    fn find_link(&self, key: &LinkKey) -> Result<Option<AccountLink>, StoreError>;

    fn find_by_email(&self, email: &str) -> Result<Option<AccountId>, StoreError>;

    fn account(&self, id: &AccountId) -> Result<Option<Account>, StoreError>;

    fn link(
        &self,
        key: &LinkKey,
        account_id: &AccountId,
        idp_entity_id: &str,
        now: OffsetDateTime,
    ) -> Result<LinkOutcome, StoreError>;

    /// Creates the account and its link in one step. If the key got linked in
    /// the meantime no account is created.
    fn create_linked(
        &self,
        account: NewAccount,
        key: &LinkKey,
        idp_entity_id: &str,
        now: OffsetDateTime,
    ) -> Result<LinkOutcome, StoreError>;
}

#[derive(Debug, Default)]
struct Inner {
    accounts: BTreeMap<AccountId, Account>,
    links: HashMap<LinkKey, AccountLink>,
    next_id: u64,
}

impl Inner {
    fn insert_link(
        &mut self,
        key: &LinkKey,
        account_id: &AccountId,
        idp_entity_id: &str,
        now: OffsetDateTime,
    ) {
        self.links.insert(
            key.clone(),
            AccountLink {
                key: key.clone(),
                account_id: account_id.clone(),
                idp_entity_id: idp_entity_id.to_string(),
                linked_at: now,
            },
        );
    }
}

/// Account store kept in process memory, with every write under one lock.
#[derive(Debug, Default)]
pub struct MemoryAccountStore {
    inner: Mutex<Inner>,
}

impl MemoryAccountStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError("account store lock poisoned".into()))
    }

    /// Adds an account that exists independently of any federated login.
    pub fn insert_account(&self, account: NewAccount) -> Result<AccountId, StoreError> {
        let mut inner = self.lock()?;
        inner.next_id += 1;
        let id = AccountId(format!("account-{}", inner.next_id));
        inner.accounts.insert(
            id.clone(),
            Account {
                id: id.clone(),
                email: account.email,
                display_name: account.display_name,
                username: account.username,
            },
        );
        Ok(id)
    }

    pub fn account_count(&self) -> Result<usize, StoreError> {
        Ok(self.lock()?.accounts.len())
    }

    pub fn links_for(&self, account_id: &AccountId) -> Result<Vec<AccountLink>, StoreError> {
        Ok(self
            .lock()?
            .links
            .values()
            .filter(|link| &link.account_id == account_id)
            .cloned()
            .collect())
    }
}

impl AccountStore for MemoryAccountStore {
    fn find_link(&self, key: &LinkKey) -> Result<Option<AccountLink>, StoreError> {
        Ok(self.lock()?.links.get(key).cloned())
    }

    fn find_by_email(&self, email: &str) -> Result<Option<AccountId>, StoreError> {
        Ok(self
            .lock()?
            .accounts
            .values()
            .find(|account| {
                account
                    .email
                    .as_deref()
                    .is_some_and(|existing| existing.eq_ignore_ascii_case(email))
            })
            .map(|account| account.id.clone()))
    }

    fn account(&self, id: &AccountId) -> Result<Option<Account>, StoreError> {
        Ok(self.lock()?.accounts.get(id).cloned())
    }

    fn link(
        &self,
        key: &LinkKey,
        account_id: &AccountId,
        idp_entity_id: &str,
        now: OffsetDateTime,
    ) -> Result<LinkOutcome, StoreError> {
        let mut inner = self.lock()?;
        if let Some(existing) = inner.links.get(key) {
            return Ok(LinkOutcome::Existing(existing.account_id.clone()));
        }
        if !inner.accounts.contains_key(account_id) {
            return Err(StoreError(format!("no account {account_id}")));
        }
        inner.insert_link(key, account_id, idp_entity_id, now);
        Ok(LinkOutcome::Created(account_id.clone()))
    }

    fn create_linked(
        &self,
        account: NewAccount,
        key: &LinkKey,
        idp_entity_id: &str,
        now: OffsetDateTime,
    ) -> Result<LinkOutcome, StoreError> {
        let mut inner = self.lock()?;
        if let Some(existing) = inner.links.get(key) {
            return Ok(LinkOutcome::Existing(existing.account_id.clone()));
        }
        inner.next_id += 1;
        let id = AccountId(format!("account-{}", inner.next_id));
        inner.accounts.insert(
            id.clone(),
            Account {
                id: id.clone(),
                email: account.email,
                display_name: account.display_name,
                username: account.username,
            },
        );
        inner.insert_link(key, &id, idp_entity_id, now);
        Ok(LinkOutcome::Created(id))
    }
}
