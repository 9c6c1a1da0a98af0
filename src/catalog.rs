use crate::config::StorageConfig;
use crate::errors::Result;
use crate::models::CatalogRow;
use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

// SQLite caps bound parameters per statement; stay well under it.
const LOOKUP_CHUNK: usize = 500;

pub struct Catalog {
    conn: Arc<Mutex<Connection>>,
}

impl Catalog {
    pub fn new(config: &StorageConfig) -> Result<Self> {
        let conn = Connection::open(&config.catalog_path)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn initialize_schema(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS entity_rows (
                row_id TEXT PRIMARY KEY,
                sync_id TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                entity_type TEXT NOT NULL,
                content_hash TEXT NOT NULL,
                UNIQUE (sync_id, entity_id)
            );
            CREATE INDEX IF NOT EXISTS idx_entity_rows_sync ON entity_rows (sync_id);
            COMMIT;",
        )?;
        Ok(())
    }

    /// Bulk point lookup: rows for the given `(sync_id, entity_id)` pairs,
    /// keyed by entity_id. Absent ids are simply missing from the map.
    pub fn get_rows(
        &self,
        sync_id: Uuid,
        entity_ids: &[String],
    ) -> Result<HashMap<String, CatalogRow>> {
        let conn = self.conn.lock().unwrap();
        let sync_id_str = sync_id.to_string();
        let mut found = HashMap::with_capacity(entity_ids.len());

        for chunk in entity_ids.chunks(LOOKUP_CHUNK) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let sql = format!(
                "SELECT row_id, sync_id, entity_id, entity_type, content_hash
                 FROM entity_rows WHERE sync_id = ? AND entity_id IN ({placeholders})"
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut values: Vec<&dyn rusqlite::ToSql> = vec![&sync_id_str];
            for id in chunk {
                values.push(id);
            }
            let mut rows = stmt.query(values.as_slice())?;
            while let Some(row) = rows.next()? {
                let parsed = read_row(row)?;
                found.insert(parsed.entity_id.clone(), parsed);
            }
        }

        Ok(found)
    }

    /// Bulk insert of freshly minted rows. Row ids must already be assigned.
    pub fn create_rows(&self, rows: &[CatalogRow]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let conn = self.conn.lock().unwrap();
        let tx = conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO entity_rows (row_id, sync_id, entity_id, entity_type, content_hash)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for row in rows {
                stmt.execute(params![
                    row.row_id.to_string(),
                    row.sync_id.to_string(),
                    row.entity_id,
                    row.entity_type,
                    row.hash,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Bulk hash update for existing rows, addressed by row id.
    pub fn update_hashes(&self, updates: &[(Uuid, String)]) -> Result<()> {
        if updates.is_empty() {
            return Ok(());
        }
        let conn = self.conn.lock().unwrap();
        let tx = conn.unchecked_transaction()?;
        {
            let mut stmt =
                tx.prepare("UPDATE entity_rows SET content_hash = ?1 WHERE row_id = ?2")?;
            for (row_id, hash) in updates {
                stmt.execute(params![hash, row_id.to_string()])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Bulk removal by row id. Rows already absent are ignored.
    pub fn remove_rows(&self, row_ids: &[Uuid]) -> Result<()> {
        if row_ids.is_empty() {
            return Ok(());
        }
        let conn = self.conn.lock().unwrap();
        let tx = conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare("DELETE FROM entity_rows WHERE row_id = ?1")?;
            for row_id in row_ids {
                stmt.execute(params![row_id.to_string()])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Every row currently stored for a sync, used by orphan reconciliation.
    pub fn rows_for_sync(&self, sync_id: Uuid) -> Result<Vec<CatalogRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT row_id, sync_id, entity_id, entity_type, content_hash
             FROM entity_rows WHERE sync_id = ?1",
        )?;
        let mut rows = stmt.query(params![sync_id.to_string()])?;
        let mut all = Vec::new();
        while let Some(row) = rows.next()? {
            all.push(read_row(row)?);
        }
        Ok(all)
    }
}

fn read_row(row: &rusqlite::Row<'_>) -> Result<CatalogRow> {
    let row_id: String = row.get(0)?;
    let sync_id: String = row.get(1)?;
    Ok(CatalogRow {
        row_id: parse_uuid(&row_id)?,
        sync_id: parse_uuid(&sync_id)?,
        entity_id: row.get(2)?,
        entity_type: row.get(3)?,
        hash: row.get(4)?,
    })
}

fn parse_uuid(value: &str) -> Result<Uuid> {
    Uuid::parse_str(value)
        .map_err(|err| crate::errors::StoreError::InvalidArg(format!("bad uuid {value}: {err}")))
}
