use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::resume::ResumeRecord;

#[cfg(feature = "sqlite")]
use crate::resume::ChunkCheckpoint;
#[cfg(feature = "sqlite")]
use rusqlite::params;

pub trait ResumeStore: Send + Sync {
    fn load(&self, key: &str) -> CoreResult<Option<ResumeRecord>>;
    fn save(&mut self, record: &ResumeRecord) -> CoreResult<()>;
    fn discard(&mut self, key: &str) -> CoreResult<()>;
}

#[derive(Default)]
pub struct MemoryStore {
    records: HashMap<String, ResumeRecord>,
}

impl ResumeStore for MemoryStore {
    fn load(&self, key: &str) -> CoreResult<Option<ResumeRecord>> {
        Ok(self.records.get(key).cloned())
    }

    fn save(&mut self, record: &ResumeRecord) -> CoreResult<()> {
        self.records.insert(record.key.clone(), record.clone());
        Ok(())
    }

    fn discard(&mut self, key: &str) -> CoreResult<()> {
        self.records.remove(key);
        Ok(())
    }
}

pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> CoreResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|err| CoreError::Storage(err.to_string()))?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let name = Uuid::new_v5(&Uuid::NAMESPACE_URL, key.as_bytes());
        self.dir.join(format!("{}.json", name))
    }
}

impl ResumeStore for JsonFileStore {
    fn load(&self, key: &str) -> CoreResult<Option<ResumeRecord>> {
        let raw = match fs::read_to_string(self.path_for(key)) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(CoreError::Storage(err.to_string())),
        };
        let record: ResumeRecord =
            serde_json::from_str(&raw).map_err(|err| CoreError::Storage(err.to_string()))?;
        Ok(Some(record))
    }

    fn save(&mut self, record: &ResumeRecord) -> CoreResult<()> {
        let path = self.path_for(&record.key);
        let tmp = path.with_extension("json.tmp");
        let raw =
            serde_json::to_vec_pretty(record).map_err(|err| CoreError::Storage(err.to_string()))?;
        fs::write(&tmp, raw).map_err(|err| CoreError::Storage(err.to_string()))?;
        fs::rename(&tmp, &path).map_err(|err| CoreError::Storage(err.to_string()))?;
        Ok(())
    }

    fn discard(&mut self, key: &str) -> CoreResult<()> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(CoreError::Storage(err.to_string())),
        }
    }
}

#[cfg(feature = "sqlite")]
pub struct SqliteStore {
    pub path: String,
}

#[cfg(feature = "sqlite")]
impl SqliteStore {
    pub fn new(path: impl Into<String>) -> CoreResult<Self> {
        let store = Self { path: path.into() };
        store.init()?;
        Ok(store)
    }

    fn conn(&self) -> CoreResult<rusqlite::Connection> {
        rusqlite::Connection::open(&self.path).map_err(|err| CoreError::Storage(err.to_string()))
    }

    fn init(&self) -> CoreResult<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS resume_records (
                key TEXT PRIMARY KEY,
                validator TEXT,
                total_bytes INTEGER NOT NULL,
                ranges_unsupported INTEGER NOT NULL DEFAULT 0,
                updated_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS resume_chunks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                record_key TEXT NOT NULL,
                chunk_index INTEGER NOT NULL,
                range_start INTEGER NOT NULL,
                range_end INTEGER NOT NULL,
                bytes_committed INTEGER NOT NULL DEFAULT 0,
                FOREIGN KEY(record_key) REFERENCES resume_records(key)
            );
            ",
        )
        .map_err(|err| CoreError::Storage(err.to_string()))?;
        Ok(())
    }
}

#[cfg(feature = "sqlite")]
impl ResumeStore for SqliteStore {
    fn load(&self, key: &str) -> CoreResult<Option<ResumeRecord>> {
        use rusqlite::OptionalExtension;

        let conn = self.conn()?;
        let header = conn
            .query_row(
                "
                SELECT validator, total_bytes, ranges_unsupported, updated_at
                FROM resume_records WHERE key = ?1
                ",
                params![key],
                |row| {
                    Ok((
                        row.get::<_, Option<String>>(0)?,
                        row.get::<_, i64>(1)? as u64,
                        row.get::<_, bool>(2)?,
                        row.get::<_, i64>(3)? as u64,
                    ))
                },
            )
            .optional()
            .map_err(|err| CoreError::Storage(err.to_string()))?;
        let Some((validator, total_bytes, ranges_unsupported, updated_at)) = header else {
            return Ok(None);
        };

        let mut stmt = conn
            .prepare(
                "
                SELECT range_start, range_end, bytes_committed
                FROM resume_chunks WHERE record_key = ?1 ORDER BY chunk_index ASC
                ",
            )
            .map_err(|err| CoreError::Storage(err.to_string()))?;
        let rows = stmt
            .query_map(params![key], |row| {
                Ok(ChunkCheckpoint {
                    range_start: row.get::<_, i64>(0)? as u64,
                    range_end: row.get::<_, i64>(1)? as u64,
                    bytes_committed: row.get::<_, i64>(2)? as u64,
                })
            })
            .map_err(|err| CoreError::Storage(err.to_string()))?;

        let mut chunks = Vec::new();
        for row in rows {
            chunks.push(row.map_err(|err| CoreError::Storage(err.to_string()))?);
        }

        Ok(Some(ResumeRecord {
            key: key.to_string(),
            validator,
            total_bytes,
            ranges_unsupported,
            chunks,
            updated_at,
        }))
    }

    fn save(&mut self, record: &ResumeRecord) -> CoreResult<()> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .map_err(|err| CoreError::Storage(err.to_string()))?;
        tx.execute(
            "
            INSERT INTO resume_records (key, validator, total_bytes, ranges_unsupported, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(key) DO UPDATE SET
                validator=excluded.validator,
                total_bytes=excluded.total_bytes,
                ranges_unsupported=excluded.ranges_unsupported,
                updated_at=excluded.updated_at
            ",
            params![
                record.key.as_str(),
                record.validator.as_deref(),
                record.total_bytes as i64,
                record.ranges_unsupported,
                record.updated_at as i64,
            ],
        )
        .map_err(|err| CoreError::Storage(err.to_string()))?;

        tx.execute(
            "DELETE FROM resume_chunks WHERE record_key = ?1",
            params![record.key.as_str()],
        )
        .map_err(|err| CoreError::Storage(err.to_string()))?;
        for (index, chunk) in record.chunks.iter().enumerate() {
            tx.execute(
                "
                INSERT INTO resume_chunks (record_key, chunk_index, range_start, range_end, bytes_committed)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ",
                params![
                    record.key.as_str(),
                    index as i64,
                    chunk.range_start as i64,
                    chunk.range_end as i64,
                    chunk.bytes_committed as i64,
                ],
            )
            .map_err(|err| CoreError::Storage(err.to_string()))?;
        }

        tx.commit()
            .map_err(|err| CoreError::Storage(err.to_string()))?;
        Ok(())
    }

    fn discard(&mut self, key: &str) -> CoreResult<()> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .map_err(|err| CoreError::Storage(err.to_string()))?;
        tx.execute(
            "DELETE FROM resume_chunks WHERE record_key = ?1",
            params![key],
        )
        .map_err(|err| CoreError::Storage(err.to_string()))?;
        tx.execute("DELETE FROM resume_records WHERE key = ?1", params![key])
            .map_err(|err| CoreError::Storage(err.to_string()))?;
        tx.commit()
            .map_err(|err| CoreError::Storage(err.to_string()))?;
        Ok(())
    }
}
