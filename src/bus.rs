//! Durable inter-worker messaging.
//!
//! Messages are addressed by worker identity. Delivery is at-least-once:
//! `receive` leases messages and they come back after the lease expires
//! unless acknowledged. Messages to unknown identities, or that exhaust
//! their delivery attempts, land in the dead-letter table.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::db::DbHandle;
use crate::errors::BusError;
use crate::work::store::{parse_timestamp, timestamp};

/// Pseudo-identity used for messages the orchestrator sends itself.
pub const ORCHESTRATOR_IDENTITY: &str = "orchestrator";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: i64,
    pub sender: String,
    pub recipient: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub delivery_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeadLetter {
    pub id: i64,
    pub message_id: Option<i64>,
    pub sender: String,
    pub recipient: String,
    pub payload: serde_json::Value,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "id", rename_all = "snake_case")]
pub enum Delivery {
    Queued(i64),
    DeadLettered(i64),
}

impl Delivery {
    pub fn is_queued(&self) -> bool {
        matches!(self, Self::Queued(_))
    }
}

/// Delivery tuning.
#[derive(Debug, Clone, Copy)]
pub struct BusSettings {
    /// How long a received message stays invisible awaiting its ack.
    pub ack_timeout: Duration,
    pub max_delivery_attempts: u32,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(30),
            max_delivery_attempts: 5,
        }
    }
}

/// Synchronous SQLite side of the bus.
pub struct BusStore {
    conn: Connection,
}

impl BusStore {
    pub fn open(path: &Path) -> Result<Self> {
        let store = Self {
            conn: crate::db::open_connection(path)?,
        };
        store.run_migrations()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let store = Self {
            conn: crate::db::open_in_memory()?,
        };
        store.run_migrations()?;
        Ok(store)
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS mailboxes (
                    identity TEXT PRIMARY KEY,
                    registered_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS messages (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    sender TEXT NOT NULL,
                    recipient TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    delivery_attempts INTEGER NOT NULL DEFAULT 0,
                    leased_until TEXT,
                    acked_at TEXT
                );

                CREATE TABLE IF NOT EXISTS dead_letters (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    message_id INTEGER,
                    sender TEXT NOT NULL,
                    recipient TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    reason TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_messages_recipient
                    ON messages(recipient, acked_at, id);
                ",
            )
            .context("Failed to create message bus tables")?;
        Ok(())
    }

    pub fn register(&self, identity: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR IGNORE INTO mailboxes (identity, registered_at) VALUES (?1, ?2)",
                params![identity, timestamp(&Utc::now())],
            )
            .context("Failed to register mailbox")?;
        Ok(())
    }

    /// Remove a mailbox; its unacked messages become dead letters.
    pub fn unregister(&self, identity: &str) -> Result<usize> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin unregister transaction")?;
        tx.execute("DELETE FROM mailboxes WHERE identity = ?1", params![identity])
            .context("Failed to delete mailbox")?;
        let moved = tx
            .execute(
                "INSERT INTO dead_letters (message_id, sender, recipient, payload, reason, created_at)
                 SELECT id, sender, recipient, payload, 'recipient unregistered', ?2
                 FROM messages WHERE recipient = ?1 AND acked_at IS NULL",
                params![identity, timestamp(&Utc::now())],
            )
            .context("Failed to dead-letter pending messages")?;
        tx.execute(
            "DELETE FROM messages WHERE recipient = ?1 AND acked_at IS NULL",
            params![identity],
        )
        .context("Failed to drop pending messages")?;
        tx.commit().context("Failed to commit unregister")?;
        Ok(moved)
    }

    pub fn is_registered(&self, identity: &str) -> Result<bool> {
        self.conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM mailboxes WHERE identity = ?1)",
                params![identity],
                |row| row.get(0),
            )
            .context("Failed to query mailbox")
    }

    pub fn identities(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT identity FROM mailboxes ORDER BY identity")
            .context("Failed to prepare identities")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .context("Failed to query identities")?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row.context("Failed to read identity row")?);
        }
        Ok(ids)
    }

    /// Queue for a registered recipient, dead-letter otherwise. One
    /// conditional insert decides, so a concurrent unregister cannot leave a
    /// message in a mailbox that no longer exists.
    pub fn send(&self, sender: &str, recipient: &str, payload: &serde_json::Value) -> Result<Delivery> {
        let payload = serde_json::to_string(payload).context("Failed to encode payload")?;
        let now = timestamp(&Utc::now());
        let queued = self
            .conn
            .execute(
                "INSERT INTO messages (sender, recipient, payload, created_at)
                 SELECT ?1, ?2, ?3, ?4 WHERE EXISTS (SELECT 1 FROM mailboxes WHERE identity = ?2)",
                params![sender, recipient, payload, now],
            )
            .context("Failed to queue message")?;
        if queued > 0 {
            return Ok(Delivery::Queued(self.conn.last_insert_rowid()));
        }
        self.conn
            .execute(
                "INSERT INTO dead_letters (message_id, sender, recipient, payload, reason, created_at)
                 VALUES (NULL, ?1, ?2, ?3, 'unknown recipient', ?4)",
                params![sender, recipient, payload, now],
            )
            .context("Failed to write dead letter")?;
        Ok(Delivery::DeadLettered(self.conn.last_insert_rowid()))
    }

    /// Lease up to `limit` deliverable messages for `identity`.
    pub fn receive(&self, identity: &str, limit: usize, settings: &BusSettings) -> Result<Vec<Message>> {
        let now = Utc::now();
        let now_s = timestamp(&now);
        let lease = chrono::Duration::from_std(settings.ack_timeout)
            .context("Ack timeout out of range")?;
        let lease_until = timestamp(&(now + lease));

        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin receive transaction")?;
        // Acked rows are kept for one lease so a repeated ack still succeeds.
        let retained_since = timestamp(&(now - lease));
        tx.execute(
            "DELETE FROM messages WHERE recipient = ?1 AND acked_at IS NOT NULL AND acked_at < ?2",
            params![identity, retained_since],
        )
        .context("Failed to prune acked messages")?;
        tx.execute(
            "INSERT INTO dead_letters (message_id, sender, recipient, payload, reason, created_at)
             SELECT id, sender, recipient, payload, 'max delivery attempts exceeded', ?3
             FROM messages
             WHERE recipient = ?1 AND acked_at IS NULL AND delivery_attempts >= ?2
               AND (leased_until IS NULL OR leased_until < ?3)",
            params![identity, settings.max_delivery_attempts, now_s],
        )
        .context("Failed to dead-letter exhausted messages")?;
        tx.execute(
            "DELETE FROM messages
             WHERE recipient = ?1 AND acked_at IS NULL AND delivery_attempts >= ?2
               AND (leased_until IS NULL OR leased_until < ?3)",
            params![identity, settings.max_delivery_attempts, now_s],
        )
        .context("Failed to drop exhausted messages")?;

        let mut messages = {
            let mut stmt = tx
                .prepare(
                    "UPDATE messages
                     SET delivery_attempts = delivery_attempts + 1, leased_until = ?3
                     WHERE id IN (
                         SELECT id FROM messages
                         WHERE recipient = ?1 AND acked_at IS NULL
                           AND (leased_until IS NULL OR leased_until < ?2)
                         ORDER BY id LIMIT ?4)
                     RETURNING id, sender, recipient, payload, created_at, delivery_attempts",
                )
                .context("Failed to prepare receive")?;
            let rows = stmt
                .query_map(
                    params![identity, now_s, lease_until, limit as i64],
                    MessageRow::from_row,
                )
                .context("Failed to lease messages")?;
            let mut messages = Vec::new();
            for row in rows {
                messages.push(row.context("Failed to read message row")?.into_message()?);
            }
            messages
        };
        tx.commit().context("Failed to commit receive")?;
        messages.sort_by_key(|m| m.id);
        Ok(messages)
    }

    /// Returns whether the message was (or already had been) acknowledged.
    pub fn ack(&self, identity: &str, message_id: i64) -> Result<bool> {
        self.conn
            .execute(
                "UPDATE messages SET acked_at = COALESCE(acked_at, ?3) WHERE id = ?1 AND recipient = ?2",
                params![message_id, identity, timestamp(&Utc::now())],
            )
            .map(|n| n > 0)
            .context("Failed to ack message")
    }

    pub fn pending_count(&self, identity: &str) -> Result<usize> {
        let n: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM messages WHERE recipient = ?1 AND acked_at IS NULL",
                params![identity],
                |row| row.get(0),
            )
            .context("Failed to count pending messages")?;
        Ok(n as usize)
    }

    pub fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, message_id, sender, recipient, payload, reason, created_at
                 FROM dead_letters ORDER BY id",
            )
            .context("Failed to prepare dead_letters")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, Option<i64>>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                ))
            })
            .context("Failed to query dead letters")?;
        let mut letters = Vec::new();
        for row in rows {
            let (id, message_id, sender, recipient, payload, reason, created_at) =
                row.context("Failed to read dead letter row")?;
            letters.push(DeadLetter {
                id,
                message_id,
                sender,
                recipient,
                payload: serde_json::from_str(&payload).context("Corrupt dead letter payload")?,
                reason,
                created_at: parse_timestamp(&created_at)?,
            });
        }
        Ok(letters)
    }
}

struct MessageRow {
    id: i64,
    sender: String,
    recipient: String,
    payload: String,
    created_at: String,
    delivery_attempts: i64,
}

impl MessageRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            sender: row.get(1)?,
            recipient: row.get(2)?,
            payload: row.get(3)?,
            created_at: row.get(4)?,
            delivery_attempts: row.get(5)?,
        })
    }

    fn into_message(self) -> Result<Message> {
        Ok(Message {
            payload: serde_json::from_str(&self.payload)
                .with_context(|| format!("Corrupt payload in message {}", self.id))?,
            created_at: parse_timestamp(&self.created_at)?,
            delivery_attempts: u32::try_from(self.delivery_attempts).unwrap_or(u32::MAX),
            id: self.id,
            sender: self.sender,
            recipient: self.recipient,
        })
    }
}

/// Async message bus shared by the orchestrator and CLI.
#[derive(Clone)]
pub struct MessageBus {
    db: DbHandle<BusStore>,
    settings: BusSettings,
}

impl MessageBus {
    pub fn new(store: BusStore, settings: BusSettings) -> Self {
        Self {
            db: DbHandle::new(store),
            settings,
        }
    }

    pub fn open(path: &Path, settings: BusSettings) -> Result<Self, BusError> {
        let store = BusStore::open(path)
            .with_context(|| format!("Failed to open message bus at {}", path.display()))?;
        Ok(Self::new(store, settings))
    }

    pub fn open_in_memory(settings: BusSettings) -> Result<Self, BusError> {
        Ok(Self::new(BusStore::open_in_memory()?, settings))
    }

    pub fn settings(&self) -> &BusSettings {
        &self.settings
    }

    pub async fn register(&self, identity: &str) -> Result<(), BusError> {
        let identity = identity.to_string();
        self.db
            .call(move |s| Ok::<_, BusError>(s.register(&identity)?))
            .await
    }

    pub async fn unregister(&self, identity: &str) -> Result<(), BusError> {
        let id = identity.to_string();
        let moved = self
            .db
            .call(move |s| Ok::<_, BusError>(s.unregister(&id)?))
            .await?;
        if moved > 0 {
            warn!(identity, moved, "Unregistered mailbox had pending messages");
        }
        Ok(())
    }

    pub async fn is_registered(&self, identity: &str) -> Result<bool, BusError> {
        let identity = identity.to_string();
        self.db
            .call(move |s| Ok::<_, BusError>(s.is_registered(&identity)?))
            .await
    }

    pub async fn send(
        &self,
        from: &str,
        to: &str,
        payload: serde_json::Value,
    ) -> Result<Delivery, BusError> {
        let (sender, recipient) = (from.to_string(), to.to_string());
        let delivery = self
            .db
            .call(move |s| Ok::<_, BusError>(s.send(&sender, &recipient, &payload)?))
            .await?;
        match delivery {
            Delivery::Queued(id) => debug!(from, to, message_id = id, "Message queued"),
            Delivery::DeadLettered(id) => {
                warn!(from, to, dead_letter = id, "Recipient unknown; message dead-lettered")
            }
        }
        Ok(delivery)
    }

    /// Send one copy to every registered identity except the sender.
    pub async fn broadcast(
        &self,
        from: &str,
        payload: serde_json::Value,
    ) -> Result<Vec<i64>, BusError> {
        let sender = from.to_string();
        let ids = self
            .db
            .call(move |s| {
                let mut ids = Vec::new();
                for identity in s.identities()? {
                    if identity == sender {
                        continue;
                    }
                    if let Delivery::Queued(id) = s.send(&sender, &identity, &payload)? {
                        ids.push(id);
                    }
                }
                Ok::<_, BusError>(ids)
            })
            .await?;
        info!(from, copies = ids.len(), "Broadcast queued");
        Ok(ids)
    }

    pub async fn receive(&self, identity: &str, limit: usize) -> Result<Vec<Message>, BusError> {
        let id = identity.to_string();
        let settings = self.settings;
        self.db
            .call(move |s| Ok::<_, BusError>(s.receive(&id, limit, &settings)?))
            .await
    }

    pub async fn ack(&self, identity: &str, message_id: i64) -> Result<(), BusError> {
        let id = identity.to_string();
        self.db
            .call(move |s| {
                if s.ack(&id, message_id)? {
                    Ok(())
                } else {
                    Err(BusError::MessageNotFound {
                        id: message_id,
                        identity: id,
                    })
                }
            })
            .await
    }

    pub async fn pending_count(&self, identity: &str) -> Result<usize, BusError> {
        let id = identity.to_string();
        self.db
            .call(move |s| Ok::<_, BusError>(s.pending_count(&id)?))
            .await
    }

    pub async fn dead_letters(&self) -> Result<Vec<DeadLetter>, BusError> {
        self.db
            .call(|s| Ok::<_, BusError>(s.dead_letters()?))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bus(settings: BusSettings) -> MessageBus {
        MessageBus::open_in_memory(settings).expect("in-memory bus")
    }

    #[tokio::test]
    async fn unknown_recipient_goes_to_dead_letters() -> anyhow::Result<()> {
        let bus = bus(BusSettings::default());
        let delivery = bus.send("w1", "ghost", json!({"hello": 1})).await?;
        assert!(matches!(delivery, Delivery::DeadLettered(_)));
        let letters = bus.dead_letters().await?;
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].recipient, "ghost");
        assert_eq!(letters[0].reason, "unknown recipient");
        assert_eq!(letters[0].payload, json!({"hello": 1}));
        Ok(())
    }

    #[tokio::test]
    async fn unacked_messages_are_redelivered_after_lease() -> anyhow::Result<()> {
        let bus = bus(BusSettings {
            ack_timeout: Duration::from_millis(0),
            max_delivery_attempts: 5,
        });
        bus.register("w2").await?;
        bus.send("w1", "w2", json!("ping")).await?;

        let first = bus.receive("w2", 10).await?;
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].delivery_attempts, 1);

        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = bus.receive("w2", 10).await?;
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].id, first[0].id);
        assert_eq!(second[0].delivery_attempts, 2);

        bus.ack("w2", first[0].id).await?;
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(bus.receive("w2", 10).await?.is_empty());
        assert_eq!(bus.pending_count("w2").await?, 0);
        Ok(())
    }

    async fn stored_messages(bus: &MessageBus) -> anyhow::Result<i64> {
        bus.db
            .call(|s| {
                s.conn
                    .query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))
                    .context("count messages")
            })
            .await
    }

    #[tokio::test]
    async fn acked_messages_are_pruned_on_next_receive() -> anyhow::Result<()> {
        let bus = bus(BusSettings {
            ack_timeout: Duration::from_millis(0),
            max_delivery_attempts: 5,
        });
        bus.register("w2").await?;
        for n in 0..3 {
            bus.send("w1", "w2", json!(n)).await?;
        }
        for m in bus.receive("w2", 10).await? {
            bus.ack("w2", m.id).await?;
        }
        assert_eq!(stored_messages(&bus).await?, 3);

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(bus.receive("w2", 10).await?.is_empty());
        assert_eq!(stored_messages(&bus).await?, 0);
        assert!(bus.dead_letters().await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn leased_messages_are_hidden_until_timeout() -> anyhow::Result<()> {
        let bus = bus(BusSettings {
            ack_timeout: Duration::from_secs(60),
            max_delivery_attempts: 5,
        });
        bus.register("w2").await?;
        bus.send("w1", "w2", json!(1)).await?;
        bus.send("w1", "w2", json!(2)).await?;
        let got = bus.receive("w2", 1).await?;
        assert_eq!(got[0].payload, json!(1));
        let next = bus.receive("w2", 10).await?;
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].payload, json!(2));
        assert_eq!(bus.pending_count("w2").await?, 2);
        Ok(())
    }

    #[tokio::test]
    async fn exhausted_messages_are_dead_lettered() -> anyhow::Result<()> {
        let bus = bus(BusSettings {
            ack_timeout: Duration::from_millis(0),
            max_delivery_attempts: 2,
        });
        bus.register("w2").await?;
        bus.send("w1", "w2", json!("flaky")).await?;
        for _ in 0..2 {
            assert_eq!(bus.receive("w2", 10).await?.len(), 1);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(bus.receive("w2", 10).await?.is_empty());
        let letters = bus.dead_letters().await?;
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].reason, "max delivery attempts exceeded");
        Ok(())
    }

    #[tokio::test]
    async fn broadcast_skips_sender() -> anyhow::Result<()> {
        let bus = bus(BusSettings::default());
        for id in ["a", "b", "c"] {
            bus.register(id).await?;
        }
        let ids = bus.broadcast("a", json!({"kind": "sync"})).await?;
        assert_eq!(ids.len(), 2);
        assert_eq!(bus.pending_count("a").await?, 0);
        assert_eq!(bus.pending_count("b").await?, 1);
        assert_eq!(bus.pending_count("c").await?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn ack_of_foreign_message_is_rejected() -> anyhow::Result<()> {
        let bus = bus(BusSettings::default());
        bus.register("b").await?;
        let Delivery::Queued(id) = bus.send("a", "b", json!(null)).await? else {
            panic!("expected queued");
        };
        assert!(matches!(
            bus.ack("c", id).await,
            Err(BusError::MessageNotFound { .. })
        ));
        bus.ack("b", id).await?;
        // Acking twice is fine.
        bus.ack("b", id).await?;
        Ok(())
    }

    #[tokio::test]
    async fn unregister_dead_letters_pending_messages() -> anyhow::Result<()> {
        let bus = bus(BusSettings::default());
        bus.register("b").await?;
        bus.send("a", "b", json!(1)).await?;
        bus.unregister("b").await?;
        assert!(!bus.is_registered("b").await?);
        let letters = bus.dead_letters().await?;
        assert_eq!(letters[0].reason, "recipient unregistered");
        Ok(())
    }
}
