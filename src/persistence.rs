//! # Local SQLite Store
//!
//! [`PersistenceStore`] backed by a single SQLite file, for offline use and
//! for hosts that keep the ride history on the device.
//!
//! Records are stored as JSON text keyed by `(table_name, id)`, so any
//! table the core writes fits without a migration. Filters are evaluated
//! on the decoded records; the tables involved stay small (one rider's
//! rides, the local scooter fleet).

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use log::{debug, info};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use crate::error::{RideError, Result};
use crate::store::{
    merge_patch, nearby_scooters, Filter, NearbyArgs, PersistenceStore, NEARBY_SCOOTERS,
    SCOOTERS_TABLE,
};

/// SQLite-backed store.
#[derive(Debug)]
pub struct SqliteStore {
    db: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at `db_path`.
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let db = Connection::open(db_path.as_ref())?;
        Self::init_schema(&db)?;
        info!("[SqliteStore] Opened {}", db_path.as_ref().display());
        Ok(Self { db: Mutex::new(db) })
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let db = Connection::open_in_memory()?;
        Self::init_schema(&db)?;
        Ok(Self { db: Mutex::new(db) })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            -- One row per record; data holds the JSON object including its id
            CREATE TABLE IF NOT EXISTS records (
                table_name TEXT NOT NULL,
                id INTEGER NOT NULL,
                data TEXT NOT NULL,
                PRIMARY KEY (table_name, id)
            );
        "#,
        )?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.db
            .lock()
            .map_err(|_| RideError::persistence("sqlite store lock poisoned"))
    }

    /// Number of records held in `table`.
    pub fn count(&self, table: &str) -> Result<usize> {
        let db = self.lock()?;
        let count: i64 = db.query_row(
            "SELECT COUNT(*) FROM records WHERE table_name = ?1",
            params![table],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// All records of `table`, ordered by id.
    pub fn records(&self, table: &str) -> Result<Vec<Value>> {
        let db = self.lock()?;
        Self::load_table(&db, table)
    }

    fn load_table(db: &Connection, table: &str) -> Result<Vec<Value>> {
        let mut stmt =
            db.prepare("SELECT data FROM records WHERE table_name = ?1 ORDER BY id")?;
        let rows = stmt
            .query_map(params![table], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        rows.iter()
            .map(|data| serde_json::from_str(data).map_err(RideError::from))
            .collect()
    }
}

#[async_trait]
impl PersistenceStore for SqliteStore {
    async fn insert(&self, table: &str, record: Value) -> Result<Value> {
        let Value::Object(mut fields) = record else {
            return Err(RideError::persistence("records must be JSON objects"));
        };

        let db = self.lock()?;
        let id = match fields.get("id").and_then(Value::as_i64) {
            Some(id) => id,
            None => {
                let next: i64 = db.query_row(
                    "SELECT COALESCE(MAX(id), 0) + 1 FROM records WHERE table_name = ?1",
                    params![table],
                    |row| row.get(0),
                )?;
                fields.insert("id".to_string(), Value::from(next));
                next
            }
        };

        let stored = Value::Object(fields);
        db.execute(
            "INSERT INTO records (table_name, id, data) VALUES (?1, ?2, ?3)",
            params![table, id, stored.to_string()],
        )?;
        debug!("[SqliteStore] Inserted {} {}", table, id);
        Ok(stored)
    }

    async fn update(&self, table: &str, patch: Value, id: i64) -> Result<()> {
        let db = self.lock()?;
        let data: Option<String> = db
            .query_row(
                "SELECT data FROM records WHERE table_name = ?1 AND id = ?2",
                params![table, id],
                |row| row.get(0),
            )
            .optional()?;
        let data =
            data.ok_or_else(|| RideError::persistence(format!("no {} row with id {}", table, id)))?;

        let mut record: Value = serde_json::from_str(&data)?;
        merge_patch(&mut record, patch)?;
        db.execute(
            "UPDATE records SET data = ?3 WHERE table_name = ?1 AND id = ?2",
            params![table, id, record.to_string()],
        )?;
        debug!("[SqliteStore] Updated {} {}", table, id);
        Ok(())
    }

    async fn select_one(&self, table: &str, filters: &[Filter]) -> Result<Option<Value>> {
        let db = self.lock()?;
        Ok(Self::load_table(&db, table)?
            .into_iter()
            .find(|record| filters.iter().all(|f| f.matches(record))))
    }

    async fn call_procedure(&self, name: &str, args: Value) -> Result<Vec<Value>> {
        match name {
            NEARBY_SCOOTERS => {
                let args: NearbyArgs = serde_json::from_value(args)
                    .map_err(|e| RideError::persistence(format!("bad {} args: {}", name, e)))?;
                let db = self.lock()?;
                let scooters = Self::load_table(&db, SCOOTERS_TABLE)?;
                Ok(nearby_scooters(&scooters, &args))
            }
            other => Err(RideError::persistence(format!("unknown procedure '{}'", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::RIDES_TABLE;
    use serde_json::json;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_insert_assigns_ids() {
        let store = SqliteStore::in_memory().unwrap();
        let a = store.insert(RIDES_TABLE, json!({"user_id": "u1"})).await.unwrap();
        let b = store.insert(RIDES_TABLE, json!({"user_id": "u2"})).await.unwrap();
        assert_eq!(a["id"], json!(1));
        assert_eq!(b["id"], json!(2));

        // Ids are per table
        let s = store.insert(SCOOTERS_TABLE, json!({"lat": 1.0, "long": 2.0})).await.unwrap();
        assert_eq!(s["id"], json!(1));
        assert_eq!(store.count(RIDES_TABLE).unwrap(), 2);
    }

    #[tokio::test]
    async fn test_open_ride_lookup_and_finish() {
        let store = SqliteStore::in_memory().unwrap();
        let ride = store
            .insert(
                RIDES_TABLE,
                json!({"user_id": "u1", "scooter_id": 7, "finished_at": null}),
            )
            .await
            .unwrap();
        let open = [Filter::eq("user_id", "u1"), Filter::is_null("finished_at")];

        assert_eq!(store.select_one(RIDES_TABLE, &open).await.unwrap(), Some(ride));

        store
            .update(RIDES_TABLE, json!({"finished_at": "2024-05-01T10:30:00Z"}), 1)
            .await
            .unwrap();
        assert_eq!(store.select_one(RIDES_TABLE, &open).await.unwrap(), None);
        assert_eq!(
            store.records(RIDES_TABLE).unwrap()[0]["finished_at"],
            json!("2024-05-01T10:30:00Z")
        );
    }

    #[tokio::test]
    async fn test_update_missing_row() {
        let store = SqliteStore::in_memory().unwrap();
        let err = store.update(RIDES_TABLE, json!({}), 9).await.unwrap_err();
        assert!(matches!(err, RideError::Persistence { .. }));
    }

    #[tokio::test]
    async fn test_nearby_procedure() {
        let store = SqliteStore::in_memory().unwrap();
        for (lat, long) in [(37.7800, -122.4000), (37.9000, -122.4000)] {
            store
                .insert(SCOOTERS_TABLE, json!({"lat": lat, "long": long}))
                .await
                .unwrap();
        }
        let found = store
            .call_procedure(
                NEARBY_SCOOTERS,
                json!({"lat": 37.7801, "long": -122.4, "max_dist_meters": 1000.0}),
            )
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0]["id"], json!(1));

        assert!(store.call_procedure("other", json!({})).await.is_err());
    }

    #[tokio::test]
    async fn test_reopen_keeps_records() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rides.db");
        {
            let store = SqliteStore::new(&path).unwrap();
            store.insert(RIDES_TABLE, json!({"user_id": "u1"})).await.unwrap();
        }
        let store = SqliteStore::new(&path).unwrap();
        assert_eq!(store.count(RIDES_TABLE).unwrap(), 1);
    }
}
