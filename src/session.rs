//! Local sessions established by a completed handshake.

use std::fmt::Display;

use dashmap::DashMap;
use time::OffsetDateTime;

use crate::{account::AccountId, assertion::NameId, StoreError};

/// 16 random bytes, hex encoded wherever it leaves the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId([u8; 16]);

impl SessionId {
    pub fn new() -> Self {
        Self(rand::random())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let arr: [u8; 16] = bytes.try_into().ok()?;
        Some(Self(arr))
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// What single logout needs to know about a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub id: SessionId,
    pub account_id: AccountId,
    pub idp_key: String,
    pub name_id: NameId,
    pub session_index: Option<String>,
    pub created_at: OffsetDateTime,
}

impl SessionRecord {
    pub fn new(
        account_id: AccountId,
        idp_key: impl Into<String>,
        name_id: NameId,
        session_index: Option<String>,
        now: OffsetDateTime,
    ) -> Self {
        Self {
            id: SessionId::new(),
            account_id,
            idp_key: idp_key.into(),
            name_id,
            session_index,
            created_at: now,
        }
    }
}

pub trait SessionManager: Send + Sync {
    fn get(&self, id: &SessionId) -> Result<Option<SessionRecord>, StoreError>;

    fn establish(&self, record: SessionRecord) -> Result<(), StoreError>;

    /// Removes the session, returning it if it existed.
    fn terminate(&self, id: &SessionId) -> Result<Option<SessionRecord>, StoreError>;
}

#[derive(Debug, Default)]
pub struct MemorySessionManager {
    sessions: DashMap<SessionId, SessionRecord>,
}

impl MemorySessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl SessionManager for MemorySessionManager {
    fn get(&self, id: &SessionId) -> Result<Option<SessionRecord>, StoreError> {
        Ok(self.sessions.get(id).map(|entry| entry.value().clone()))
    }

    fn establish(&self, record: SessionRecord) -> Result<(), StoreError> {
        self.sessions.insert(record.id, record);
        Ok(())
    }

    fn terminate(&self, id: &SessionId) -> Result<Option<SessionRecord>, StoreError> {
        Ok(self.sessions.remove(id).map(|(_, record)| record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_roundtrips_through_hex() {
        let id = SessionId::new();
        assert_eq!(SessionId::from_hex(&id.to_hex()), Some(id));
        assert_eq!(SessionId::from_hex("abcd"), None);
        assert_eq!(SessionId::from_hex("not hex"), None);
    }

    #[test]
    fn can_establish_and_terminate() {
        let sessions = MemorySessionManager::new();
        let record = SessionRecord::new(
            AccountId::from("account-1"),
            "idp1",
            NameId::new("user@example.org"),
            Some("_s1".into()),
            OffsetDateTime::now_utc(),
        );
        let id = record.id;
        sessions.establish(record).unwrap();

        assert_eq!(sessions.get(&id).unwrap().unwrap().idp_key, "idp1");
        assert!(sessions.terminate(&id).unwrap().is_some());
        assert!(sessions.terminate(&id).unwrap().is_none());
        assert!(sessions.is_empty());
    }
}
