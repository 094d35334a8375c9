//! Maps a validated assertion onto a local account.

use serde::Deserialize;
use time::OffsetDateTime;
use tracing::{debug, info};

use crate::{
    account::{AccountId, AccountStore, LinkKey, LinkOutcome, NewAccount},
    assertion::Assertion,
    attributes::{AttributeMapping, LocalField, MappedAttributes, MultiValuePolicy},
    BindingFailure,
};

/// What happens when auto-signup meets an existing account with the same email.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmailCollisionPolicy {
    #[default]
    Reject,
    Link,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AccountPolicy {
    pub allow_auto_signup: bool,
    pub required_attributes: Vec<LocalField>,
    pub email_collision: EmailCollisionPolicy,
    pub multi_value: MultiValuePolicy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindOutcome {
    pub account_id: AccountId,
    pub is_new_account: bool,
    pub profile: MappedAttributes,
}

pub struct AccountBinder<'a> {
    store: &'a dyn AccountStore,
}

impl<'a> AccountBinder<'a> {
    pub fn new(store: &'a dyn AccountStore) -> Self {
        Self { store }
    }

    pub fn bind(
        &self,
        idp_key: &str,
        assertion: &Assertion,
        mapping: &AttributeMapping,
        policy: &AccountPolicy,
        current_account: Option<&AccountId>,
        now: OffsetDateTime,
    ) -> Result<BindOutcome, BindingFailure> {
        let profile = mapping.apply(&assertion.attributes, policy.multi_value)?;
        let key = LinkKey::new(idp_key, assertion.name_id.value.as_str());
        let outcome = |account_id: AccountId, is_new_account: bool| BindOutcome {
            account_id,
            is_new_account,
            profile: profile.clone(),
        };

        if let Some(link) = self.store.find_link(&key)? {
            if current_account.is_some_and(|current| *current != link.account_id) {
                return Err(BindingFailure::AccountConflict);
            }
            return Ok(outcome(link.account_id, false));
        }

        if let Some(current) = current_account {
            return match self.store.link(&key, current, &assertion.issuer, now)? {
                LinkOutcome::Created(id) => {
                    debug!(idp = idp_key, account = %id, "linked identity to signed-in account");
                    Ok(outcome(id, false))
                }
                LinkOutcome::Existing(id) if id == *current => Ok(outcome(id, false)),
                LinkOutcome::Existing(_) => Err(BindingFailure::AccountConflict),
            };
        }

        if !policy.allow_auto_signup {
            return Err(BindingFailure::NoLinkedAccount);
        }

        let missing = profile.missing(&policy.required_attributes);
        if !missing.is_empty() {
            return Err(BindingFailure::MissingAttributes(
                missing.iter().map(ToString::to_string).collect(),
            ));
        }

        if let Some(email) = profile.email() {
            if let Some(existing) = self.store.find_by_email(email)? {
                if policy.email_collision == EmailCollisionPolicy::Reject {
                    return Err(BindingFailure::AccountConflict);
                }
                let linked = self.store.link(&key, &existing, &assertion.issuer, now)?;
                debug!(idp = idp_key, account = %linked.account_id(), "linked identity by email");
                return Ok(outcome(linked.account_id().clone(), false));
            }
        }

        let account = NewAccount {
            email: profile.email().map(str::to_string),
            display_name: profile.display_name(),
            username: profile.username(),
        };
        match self
            .store
            .create_linked(account, &key, &assertion.issuer, now)?
        {
            LinkOutcome::Created(id) => {
                info!(idp = idp_key, account = %id, "created account on first login");
                Ok(outcome(id, true))
            }
            LinkOutcome::Existing(id) => Ok(outcome(id, false)),
        }
    }
}
