// Passphrase-encrypted chat messages and the room message log.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::crypto::cipher::{EncryptedEnvelope, SymmetricCipher};
use crate::crypto::codec::generate_message_id;
use crate::errors::{GistError, Result};
use crate::identity::custody::Session;
use crate::identity::handle::IdentityHandle;

/// Shown in place of any message that does not open under the passphrase.
pub const DECRYPTION_PLACEHOLDER: &str = "[Decryption Failed]";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Text,
}

/// A message as stored and transferred. Only ciphertext leaves the device.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub message_id: String,
    pub sender_id: IdentityHandle,
    #[serde(flatten)]
    pub envelope: EncryptedEnvelope,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type", default)]
    pub kind: MessageKind,
}

/// A record after an attempt to decrypt it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DisplayedMessage {
    pub message_id: String,
    pub sender_id: IdentityHandle,
    pub timestamp: DateTime<Utc>,
    pub body: String,
    pub decrypted: bool,
}

impl MessageRecord {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| GistError::Validation(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| GistError::Validation(format!("malformed message: {e}")))
    }
}

/// Encrypt `text` under the active session's passphrase.
pub async fn compose(cipher: &SymmetricCipher, session: &Session, text: &str) -> Result<MessageRecord> {
    let active = session.active()?;
    if text.trim().is_empty() {
        return Err(GistError::Validation("message is empty".into()));
    }

    let envelope = cipher.encrypt(text, active.passphrase_str()).await?;
    Ok(MessageRecord {
        message_id: generate_message_id()?,
        sender_id: active.handle().clone(),
        envelope,
        timestamp: Utc::now().trunc_subsecs(3),
        kind: MessageKind::Text,
    })
}

/// Decrypt a record for display. Never fails: a record that does not open
/// renders as [`DECRYPTION_PLACEHOLDER`].
pub async fn read(cipher: &SymmetricCipher, record: &MessageRecord, passphrase: &str) -> DisplayedMessage {
    let (body, decrypted) = match cipher.decrypt(&record.envelope, passphrase).await {
        Ok(text) => (text, true),
        Err(err) => {
            debug!(message_id = %record.message_id, error = %err, "message did not decrypt");
            (DECRYPTION_PLACEHOLDER.to_string(), false)
        }
    };
    DisplayedMessage {
        message_id: record.message_id.clone(),
        sender_id: record.sender_id.clone(),
        timestamp: record.timestamp,
        body,
        decrypted,
    }
}

/// Position in a room's log. Assigned by the store when a record is
/// appended, so it follows arrival order and ignores sender clocks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SyncCursor(u64);

/// Live records appended after a cursor, plus the cursor to resume from.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MessageBatch {
    pub records: Vec<MessageRecord>,
    pub cursor: Option<SyncCursor>,
}

/// Append-only per-room message log with soft deletion.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Returns `false` when a record with the same id is already in the room.
    async fn append(&self, room: &str, record: MessageRecord) -> Result<bool>;

    /// Live records appended after `cursor`, in arrival order.
    async fn fetch_since(&self, room: &str, cursor: Option<SyncCursor>) -> Result<MessageBatch>;

    /// Hide a record from later fetches. Returns `false` if it was not found.
    async fn delete(&self, room: &str, message_id: &str) -> Result<bool>;
}

struct StoredMessage {
    position: SyncCursor,
    record: MessageRecord,
    deleted: bool,
}

#[derive(Default)]
struct Rooms {
    appended: u64,
    logs: HashMap<String, Vec<StoredMessage>>,
}

#[derive(Default)]
pub struct MemoryMessageStore {
    rooms: RwLock<Rooms>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn check_room(room: &str) -> Result<()> {
    if room.trim().is_empty() {
        return Err(GistError::Validation("room id required".into()));
    }
    Ok(())
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn append(&self, room: &str, record: MessageRecord) -> Result<bool> {
        check_room(room)?;
        let mut guard = self.rooms.write().await;
        let rooms = &mut *guard;
        let log = rooms.logs.entry(room.to_string()).or_default();
        if log.iter().any(|m| m.record.message_id == record.message_id) {
            return Ok(false);
        }
        rooms.appended += 1;
        log.push(StoredMessage {
            position: SyncCursor(rooms.appended),
            record,
            deleted: false,
        });
        Ok(true)
    }

    async fn fetch_since(&self, room: &str, cursor: Option<SyncCursor>) -> Result<MessageBatch> {
        check_room(room)?;
        let rooms = self.rooms.read().await;
        let Some(log) = rooms.logs.get(room) else {
            return Ok(MessageBatch {
                records: Vec::new(),
                cursor,
            });
        };
        let unseen = log.iter().filter(|m| cursor.map_or(true, |c| m.position > c));
        let mut batch = MessageBatch {
            records: Vec::new(),
            cursor,
        };
        for stored in unseen {
            // Deleted records still advance the cursor.
            batch.cursor = Some(stored.position);
            if !stored.deleted {
                batch.records.push(stored.record.clone());
            }
        }
        Ok(batch)
    }

    async fn delete(&self, room: &str, message_id: &str) -> Result<bool> {
        check_room(room)?;
        let mut rooms = self.rooms.write().await;
        let found = rooms
            .logs
            .get_mut(room)
            .and_then(|log| log.iter_mut().find(|m| m.record.message_id == message_id));
        match found {
            Some(stored) => {
                stored.deleted = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Encrypt and append a message from the active session.
pub async fn send<M: MessageStore + ?Sized>(
    store: &M,
    cipher: &SymmetricCipher,
    session: &Session,
    room: &str,
    text: &str,
) -> Result<MessageRecord> {
    let record = compose(cipher, session, text).await?;
    if !store.append(room, record.clone()).await? {
        warn!(message_id = %record.message_id, "message id collision");
        return Err(GistError::Storage(format!("duplicate message id {}", record.message_id)));
    }
    Ok(record)
}

/// Pull everything appended after `cursor` and decrypt it with the session's
/// passphrase. Returns the messages and the cursor to use next time.
pub async fn sync_room<M: MessageStore + ?Sized>(
    store: &M,
    cipher: &SymmetricCipher,
    session: &Session,
    room: &str,
    cursor: Option<SyncCursor>,
) -> Result<(Vec<DisplayedMessage>, Option<SyncCursor>)> {
    let active = session.active()?;
    let batch = store.fetch_since(room, cursor).await?;

    let mut shown = Vec::with_capacity(batch.records.len());
    for record in &batch.records {
        shown.push(read(cipher, record, active.passphrase_str()).await);
    }
    Ok((shown, batch.cursor))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::cipher::encrypt;
    use crate::identity::custody::{CustodyOptions, KeyCustody};
    use crate::identity::directory::MemoryDirectory;
    use crate::security::secure_keystore::MemoryDeviceStorage;
    use chrono::Duration;
    use pretty_assertions::assert_eq;

    async fn active_session(handle: &str, passphrase: &str) -> Session {
        let custody = KeyCustody::new(MemoryDirectory::new(), MemoryDeviceStorage::new(), CustodyOptions::default());
        let mut session = Session::new();
        custody.register(&mut session, handle, passphrase).await.unwrap();
        session
    }

    fn record(id: &str, at: DateTime<Utc>) -> MessageRecord {
        MessageRecord {
            message_id: id.to_string(),
            sender_id: IdentityHandle::parse("A1").unwrap(),
            envelope: encrypt(id, "pw").unwrap(),
            timestamp: at.trunc_subsecs(3),
            kind: MessageKind::Text,
        }
    }

    #[tokio::test]
    async fn test_compose_then_read() {
        let cipher = SymmetricCipher::default();
        let session = active_session("A1", "correcthorse").await;

        let msg = compose(&cipher, &session, "hello").await.unwrap();
        assert!(msg.message_id.starts_with("msg_"));
        assert_eq!(msg.sender_id.as_str(), "A1");

        let shown = read(&cipher, &msg, "correcthorse").await;
        assert_eq!(shown.body, "hello");
        assert!(shown.decrypted);
    }

    #[tokio::test]
    async fn test_wrong_passphrase_renders_placeholder() {
        let cipher = SymmetricCipher::default();
        let session = active_session("A1", "correcthorse").await;
        let msg = compose(&cipher, &session, "hello").await.unwrap();

        let shown = read(&cipher, &msg, "batterystaple").await;
        assert_eq!(shown.body, DECRYPTION_PLACEHOLDER);
        assert!(!shown.decrypted);
    }

    #[tokio::test]
    async fn test_compose_requires_active_session() {
        let cipher = SymmetricCipher::default();
        let err = compose(&cipher, &Session::new(), "hello").await.unwrap_err();
        assert!(matches!(err, GistError::InvalidState("anonymous")));

        let session = active_session("A1", "pw").await;
        assert!(matches!(compose(&cipher, &session, "  ").await, Err(GistError::Validation(_))));
    }

    #[test]
    fn test_record_wire_shape() {
        let msg = record("msg_0011223344556677", Utc::now());
        let json: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        for field in ["messageId", "senderId", "content", "salt", "iv", "timestamp"] {
            assert!(json.get(field).is_some(), "missing {field}");
        }
        assert_eq!(json["type"], "text");
        assert!(json["timestamp"].is_i64());
        assert_eq!(MessageRecord::from_json(&msg.to_json().unwrap()).unwrap(), msg);
    }

    #[test]
    fn test_malformed_record_rejected() {
        let mut json: serde_json::Value = serde_json::from_str(&record("m", Utc::now()).to_json().unwrap()).unwrap();
        json["iv"] = "AAAA".into();
        assert!(MessageRecord::from_json(&json.to_string()).is_err());
    }

    fn ids(batch: &MessageBatch) -> Vec<&str> {
        batch.records.iter().map(|r| r.message_id.as_str()).collect()
    }

    #[tokio::test]
    async fn test_store_keeps_arrival_order() {
        let store = MemoryMessageStore::new();
        let t0 = Utc::now();
        store.append("room", record("b", t0 + Duration::seconds(2))).await.unwrap();
        store.append("room", record("a", t0 + Duration::seconds(1))).await.unwrap();
        assert!(!store.append("room", record("a", t0)).await.unwrap());

        let first = store.fetch_since("room", None).await.unwrap();
        assert_eq!(ids(&first), ["b", "a"]);

        store.append("room", record("c", t0 + Duration::seconds(3))).await.unwrap();
        let next = store.fetch_since("room", first.cursor).await.unwrap();
        assert_eq!(ids(&next), ["c"]);
        assert!(next.cursor > first.cursor);

        let other = store.fetch_since("other", None).await.unwrap();
        assert!(other.records.is_empty());
        assert_eq!(other.cursor, None);
    }

    #[tokio::test]
    async fn test_late_arrival_with_older_timestamp_is_fetched() {
        let store = MemoryMessageStore::new();
        let now = Utc::now();
        store.append("room", record("a", now)).await.unwrap();
        let seen = store.fetch_since("room", None).await.unwrap();

        // Sender clock five seconds behind, delivered after the sync.
        store.append("room", record("late", now - Duration::seconds(5))).await.unwrap();
        store.append("room", record("same_ms", now)).await.unwrap();

        let batch = store.fetch_since("room", seen.cursor).await.unwrap();
        assert_eq!(ids(&batch), ["late", "same_ms"]);
        assert!(store.fetch_since("room", batch.cursor).await.unwrap().records.is_empty());
    }

    #[tokio::test]
    async fn test_soft_delete() {
        let store = MemoryMessageStore::new();
        store.append("room", record("a", Utc::now())).await.unwrap();
        assert!(store.delete("room", "a").await.unwrap());
        assert!(!store.delete("room", "missing").await.unwrap());

        let batch = store.fetch_since("room", None).await.unwrap();
        assert!(batch.records.is_empty());
        assert!(batch.cursor.is_some());
        // Deleted ids stay reserved.
        assert!(!store.append("room", record("a", Utc::now())).await.unwrap());
    }

    #[tokio::test]
    async fn test_send_and_sync() {
        let cipher = SymmetricCipher::default();
        let store = MemoryMessageStore::new();
        let session = active_session("A1", "correcthorse").await;

        send(&store, &cipher, &session, "room", "first").await.unwrap();
        let (shown, cursor) = sync_room(&store, &cipher, &session, "room", None).await.unwrap();
        assert_eq!(shown.len(), 1);
        assert_eq!(shown[0].body, "first");

        let (again, same) = sync_room(&store, &cipher, &session, "room", cursor).await.unwrap();
        assert!(again.is_empty());
        assert_eq!(same, cursor);

        let mut behind = compose(&cipher, &session, "from a slow clock").await.unwrap();
        behind.sender_id = IdentityHandle::parse("B2").unwrap();
        behind.timestamp = behind.timestamp - Duration::seconds(5);
        store.append("room", behind).await.unwrap();

        let (late, _) = sync_room(&store, &cipher, &session, "room", cursor).await.unwrap();
        assert_eq!(late.len(), 1);
        assert_eq!(late[0].sender_id.as_str(), "B2");
        assert_eq!(late[0].body, "from a slow clock");
    }

    #[tokio::test]
    async fn test_empty_room_rejected() {
        let store = MemoryMessageStore::new();
        assert!(matches!(
            store.append(" ", record("a", Utc::now())).await,
            Err(GistError::Validation(_))
        ));
    }
}
