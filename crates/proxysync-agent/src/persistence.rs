//! `SQLite` persistence layer.

use parking_lot::Mutex;
use proxysync_core::{
    NeighbourRecord, Principal, ProxySubscription, RecoveredNeighbour, StoreError, StoreOp,
    SubscriptionKey, SubscriptionStore,
};
use rusqlite::{params, Connection, Result as SqliteResult, Transaction};
use std::path::Path;
use uuid::Uuid;

/// `SQLite`-backed subscription store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a `SQLite` database.
    ///
    /// # Errors
    ///
    /// Returns error if database cannot be opened or initialized.
    pub fn open(path: &Path) -> SqliteResult<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Create an in-memory database (for testing).
    ///
    /// # Errors
    ///
    /// Returns error if database cannot be created.
    #[cfg(test)]
    pub fn in_memory() -> SqliteResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Initialize database schema.
    fn init_schema(&self) -> SqliteResult<()> {
        self.conn.lock().execute_batch(
            r"
            PRAGMA foreign_keys = ON;

            -- Links to peer engines
            CREATE TABLE IF NOT EXISTS neighbours (
                id TEXT PRIMARY KEY,
                bus TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );

            -- Interests each neighbour advertised
            CREATE TABLE IF NOT EXISTS proxy_subscriptions (
                neighbour_id TEXT NOT NULL REFERENCES neighbours(id) ON DELETE CASCADE,
                topic_space TEXT NOT NULL,
                topic TEXT NOT NULL,
                topic_space_name TEXT NOT NULL,
                foreign_topic_space_name TEXT,
                ref_count INTEGER NOT NULL,
                foreign_secured INTEGER NOT NULL,
                principal TEXT,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (neighbour_id, topic_space, topic)
            );

            CREATE INDEX IF NOT EXISTS idx_proxy_subscriptions_neighbour
                ON proxy_subscriptions(neighbour_id);
            ",
        )?;

        Ok(())
    }

    fn apply_op(tx: &Transaction<'_>, op: &StoreOp, now: i64) -> SqliteResult<()> {
        match op {
            StoreOp::PutNeighbour(record) => {
                tx.execute(
                    r"
                    INSERT INTO neighbours (id, bus, updated_at) VALUES (?1, ?2, ?3)
                    ON CONFLICT(id) DO UPDATE SET bus = excluded.bus, updated_at = excluded.updated_at
                    ",
                    params![record.id.to_string(), record.bus, now],
                )?;
            }
            StoreOp::RemoveNeighbour(id) => {
                tx.execute("DELETE FROM neighbours WHERE id = ?1", [id.to_string()])?;
            }
            StoreOp::PutSubscription {
                neighbour,
                subscription,
            } => {
                let principal = match subscription.principal() {
                    Principal::SystemDefault => None,
                    Principal::User(name) => Some(name.as_str()),
                };
                tx.execute(
                    r"
                    INSERT OR REPLACE INTO proxy_subscriptions (
                        neighbour_id, topic_space, topic, topic_space_name,
                        foreign_topic_space_name, ref_count, foreign_secured, principal, updated_at
                    )
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                    ",
                    params![
                        neighbour.to_string(),
                        subscription.topic_space().to_string(),
                        subscription.topic(),
                        subscription.topic_space_name(),
                        subscription.foreign_topic_space_name(),
                        i64::from(subscription.ref_count()),
                        subscription.is_foreign_secured(),
                        principal,
                        now,
                    ],
                )?;
            }
            StoreOp::RemoveSubscription { neighbour, key } => {
                tx.execute(
                    r"
                    DELETE FROM proxy_subscriptions
                    WHERE neighbour_id = ?1 AND topic_space = ?2 AND topic = ?3
                    ",
                    params![neighbour.to_string(), key.topic_space.to_string(), key.topic],
                )?;
            }
        }
        Ok(())
    }

    fn load_subscriptions(
        conn: &Connection,
        neighbour: &str,
    ) -> Result<Vec<ProxySubscription>, StoreError> {
        let mut stmt = conn
            .prepare(
                r"
                SELECT topic_space, topic, topic_space_name, foreign_topic_space_name,
                       ref_count, foreign_secured, principal
                FROM proxy_subscriptions
                WHERE neighbour_id = ?1
                ORDER BY topic_space, topic
                ",
            )
            .map_err(recover_error)?;

        let rows = stmt
            .query_map([neighbour], |row| {
                Ok(SubscriptionRow {
                    topic_space: row.get(0)?,
                    topic: row.get(1)?,
                    topic_space_name: row.get(2)?,
                    foreign_topic_space_name: row.get(3)?,
                    ref_count: row.get(4)?,
                    foreign_secured: row.get(5)?,
                    principal: row.get(6)?,
                })
            })
            .map_err(recover_error)?
            .collect::<SqliteResult<Vec<_>>>()
            .map_err(recover_error)?;

        rows.into_iter().map(SubscriptionRow::into_subscription).collect()
    }
}

struct SubscriptionRow {
    topic_space: String,
    topic: String,
    topic_space_name: String,
    foreign_topic_space_name: Option<String>,
    ref_count: i64,
    foreign_secured: bool,
    principal: Option<String>,
}

impl SubscriptionRow {
    fn into_subscription(self) -> Result<ProxySubscription, StoreError> {
        let topic_space = parse_uuid(&self.topic_space)?;
        let ref_count = u32::try_from(self.ref_count).map_err(|e| {
            StoreError::Recover(format!("ref count {} out of range: {e}", self.ref_count))
        })?;
        let principal = self.principal.map_or(Principal::SystemDefault, Principal::User);

        Ok(ProxySubscription::new(
            SubscriptionKey::new(topic_space, self.topic),
            self.topic_space_name,
        )
        .with_foreign_name(self.foreign_topic_space_name)
        .with_security(self.foreign_secured, principal)
        .with_ref_count(ref_count))
    }
}

impl SubscriptionStore for SqliteStore {
    fn apply(&self, ops: &[StoreOp]) -> Result<(), StoreError> {
        let now = chrono::Utc::now().timestamp();
        let mut conn = self.conn.lock();

        let tx = conn.transaction().map_err(write_error)?;
        for op in ops {
            Self::apply_op(&tx, op, now).map_err(write_error)?;
        }
        tx.commit().map_err(write_error)?;

        tracing::debug!(ops = ops.len(), "Applied store transaction");
        Ok(())
    }

    fn recover(&self) -> Result<Vec<RecoveredNeighbour>, StoreError> {
        let conn = self.conn.lock();

        let mut stmt = conn
            .prepare("SELECT id, bus FROM neighbours ORDER BY id")
            .map_err(recover_error)?;
        let neighbours = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
            .map_err(recover_error)?
            .collect::<SqliteResult<Vec<_>>>()
            .map_err(recover_error)?;

        neighbours
            .into_iter()
            .map(|(id, bus)| {
                let subscriptions = Self::load_subscriptions(&conn, &id)?;
                Ok(RecoveredNeighbour {
                    record: NeighbourRecord {
                        id: parse_uuid(&id)?,
                        bus,
                    },
                    subscriptions,
                })
            })
            .collect()
    }
}

#[allow(clippy::needless_pass_by_value)]
fn write_error(err: rusqlite::Error) -> StoreError {
    StoreError::Write(err.to_string())
}

#[allow(clippy::needless_pass_by_value)]
fn recover_error(err: rusqlite::Error) -> StoreError {
    StoreError::Recover(err.to_string())
}

fn parse_uuid(value: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(value).map_err(|e| StoreError::Recover(format!("invalid id '{value}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn neighbour(bus: &str) -> NeighbourRecord {
        NeighbourRecord {
            id: Uuid::new_v4(),
            bus: bus.to_string(),
        }
    }

    fn sub(topic: &str) -> ProxySubscription {
        ProxySubscription::new(SubscriptionKey::new(Uuid::nil(), topic), "prices")
            .with_ref_count(1)
    }

    #[test]
    fn apply_and_recover() {
        let store = SqliteStore::in_memory().unwrap();
        let record = neighbour("bus-a");
        let secured = sub("stock/ibm")
            .with_foreign_name(Some("partner.prices".to_string()))
            .with_security(true, Principal::User("alice".to_string()));

        store
            .apply(&[
                StoreOp::PutNeighbour(record.clone()),
                StoreOp::PutSubscription {
                    neighbour: record.id,
                    subscription: sub("stock/aapl"),
                },
                StoreOp::PutSubscription {
                    neighbour: record.id,
                    subscription: secured.clone(),
                },
                StoreOp::RemoveSubscription {
                    neighbour: record.id,
                    key: SubscriptionKey::new(Uuid::nil(), "stock/aapl"),
                },
            ])
            .unwrap();

        let recovered = store.recover().unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].record, record);
        assert_eq!(recovered[0].subscriptions, vec![secured]);
    }

    #[test]
    fn failed_apply_is_rolled_back() {
        let store = SqliteStore::in_memory().unwrap();

        let result = store.apply(&[
            StoreOp::PutNeighbour(neighbour("bus-a")),
            StoreOp::PutSubscription {
                neighbour: Uuid::new_v4(),
                subscription: sub("t1"),
            },
        ]);

        assert!(matches!(result, Err(StoreError::Write(_))));
        assert!(store.recover().unwrap().is_empty());
    }

    #[test]
    fn moving_a_neighbour_keeps_its_subscriptions() {
        let store = SqliteStore::in_memory().unwrap();
        let mut record = neighbour("bus-a");
        store
            .apply(&[
                StoreOp::PutNeighbour(record.clone()),
                StoreOp::PutSubscription {
                    neighbour: record.id,
                    subscription: sub("t1"),
                },
            ])
            .unwrap();

        record.bus = "bus-b".to_string();
        store.apply(&[StoreOp::PutNeighbour(record.clone())]).unwrap();

        let recovered = store.recover().unwrap();
        assert_eq!(recovered[0].record.bus, "bus-b");
        assert_eq!(recovered[0].subscriptions.len(), 1);
    }

    #[test]
    fn remove_neighbour_drops_subscriptions() {
        let store = SqliteStore::in_memory().unwrap();
        let record = neighbour("bus-a");
        store
            .apply(&[
                StoreOp::PutNeighbour(record.clone()),
                StoreOp::PutSubscription {
                    neighbour: record.id,
                    subscription: sub("t1"),
                },
            ])
            .unwrap();

        store.apply(&[StoreOp::RemoveNeighbour(record.id)]).unwrap();

        assert!(store.recover().unwrap().is_empty());
        let orphans: i64 = store
            .conn
            .lock()
            .query_row("SELECT COUNT(*) FROM proxy_subscriptions", [], |row| row.get(0))
            .unwrap();
        assert_eq!(orphans, 0);
    }

    #[test]
    fn state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proxysync.db");
        let record = neighbour("bus-a");

        {
            let store = SqliteStore::open(&path).unwrap();
            store
                .apply(&[
                    StoreOp::PutNeighbour(record.clone()),
                    StoreOp::PutSubscription {
                        neighbour: record.id,
                        subscription: sub("t1").with_ref_count(3),
                    },
                ])
                .unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        let recovered = store.recover().unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].record, record);
        assert_eq!(recovered[0].subscriptions[0].ref_count(), 3);
    }
}
