// SQLite store for the recording log and enrolled faces

use chrono::NaiveDateTime;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::path::Path;

/// Timestamp layout used in `camera_logs`
pub const LOG_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// One row of `camera_logs`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordingLogEntry {
    pub id: i64,
    pub camera_name: String,
    pub file_name: String,
    pub file_path: String,
    pub start_time: String,
    pub end_time: String,
}

/// One row of `face_encodings`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FaceRecord {
    pub id: i64,
    pub name: String,
    pub age: Option<u32>,
    pub gender: Option<String>,
    #[serde(skip)]
    pub encoding: Vec<f32>,
    pub image_path: String,
}

/// Fields supplied when enrolling a face
#[derive(Debug, Clone)]
pub struct NewFace<'a> {
    pub name: &'a str,
    pub age: Option<u32>,
    pub gender: Option<&'a str>,
    pub encoding: &'a [f32],
    pub image_path: &'a str,
}

/// Durable log of finished recordings plus the face enrollment table
///
/// Wraps Connection in a parking_lot::Mutex since rusqlite::Connection is not Sync.
pub struct EventLog {
    conn: Mutex<Connection>,
}

impl EventLog {
    /// Open or create the database at `db_path`
    pub fn open(db_path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(db_path)?;

        let db = Self { conn: Mutex::new(conn) };
        db.init_schema()?;

        Ok(db)
    }

    /// Open an in-memory database
    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;

        let db = Self { conn: Mutex::new(conn) };
        db.init_schema()?;

        Ok(db)
    }

    fn init_schema(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS camera_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                camera_name TEXT NOT NULL,
                file_name TEXT NOT NULL,
                start_time TEXT NOT NULL,
                end_time TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS face_encodings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                age INTEGER,
                gender TEXT,
                encoding BLOB NOT NULL,
                image_path TEXT NOT NULL DEFAULT ''
            );

            CREATE INDEX IF NOT EXISTS idx_camera_logs_start ON camera_logs(start_time DESC);
            "#,
        )?;

        // Migration: full clip path, for logs written before it was recorded
        let has_path: bool = conn
            .prepare("SELECT COUNT(*) FROM pragma_table_info('camera_logs') WHERE name = 'file_path'")?
            .query_row([], |row| row.get::<_, i64>(0))
            .map(|count| count > 0)?;

        if !has_path {
            conn.execute_batch("ALTER TABLE camera_logs ADD COLUMN file_path TEXT NOT NULL DEFAULT ''")?;
        }

        Ok(())
    }

    // ========================================================================
    // Recording log
    // ========================================================================

    /// Append one finished recording. Returns the new row id.
    pub fn insert_recording(
        &self,
        camera_name: &str,
        file_path: &Path,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> anyhow::Result<i64> {
        let file_name = file_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO camera_logs (camera_name, file_name, file_path, start_time, end_time)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                camera_name,
                file_name,
                file_path.to_string_lossy().to_string(),
                start.format(LOG_TIME_FORMAT).to_string(),
                end.format(LOG_TIME_FORMAT).to_string(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Most recent recordings first, optionally for one camera
    pub fn recent_recordings(
        &self,
        camera_name: Option<&str>,
        limit: usize,
    ) -> anyhow::Result<Vec<RecordingLogEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT id, camera_name, file_name, file_path, start_time, end_time
            FROM camera_logs
            WHERE ?1 IS NULL OR camera_name = ?1
            ORDER BY start_time DESC, id DESC
            LIMIT ?2
            "#,
        )?;

        let mut rows_out = Vec::new();
        let mut rows = stmt.query(params![camera_name, limit as i64])?;
        while let Some(row) = rows.next()? {
            rows_out.push(RecordingLogEntry {
                id: row.get(0)?,
                camera_name: row.get(1)?,
                file_name: row.get(2)?,
                file_path: row.get(3)?,
                start_time: row.get(4)?,
                end_time: row.get(5)?,
            });
        }
        Ok(rows_out)
    }

    pub fn recording_count(&self) -> anyhow::Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM camera_logs", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    // ========================================================================
    // Enrolled faces
    // ========================================================================

    pub fn insert_face(&self, face: &NewFace<'_>) -> anyhow::Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO face_encodings (name, age, gender, encoding, image_path)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                face.name,
                face.age,
                face.gender,
                encode_embedding(face.encoding),
                face.image_path,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn list_faces(&self) -> anyhow::Result<Vec<FaceRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, name, age, gender, encoding, image_path FROM face_encodings ORDER BY id",
        )?;

        let mut faces = Vec::new();
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let blob: Vec<u8> = row.get(4)?;
            let id: i64 = row.get(0)?;
            let encoding = decode_embedding(&blob).ok_or_else(|| {
                anyhow::anyhow!("face {} has a malformed encoding ({} bytes)", id, blob.len())
            })?;
            faces.push(FaceRecord {
                id,
                name: row.get(1)?,
                age: row.get(2)?,
                gender: row.get(3)?,
                encoding,
                image_path: row.get(5)?,
            });
        }
        Ok(faces)
    }

    pub fn get_face(&self, id: i64) -> anyhow::Result<Option<FaceRecord>> {
        Ok(self.list_faces()?.into_iter().find(|f| f.id == id))
    }

    /// Update the descriptive fields of an enrolled face. The encoding never changes.
    pub fn update_face(
        &self,
        id: i64,
        name: &str,
        age: Option<u32>,
        gender: Option<&str>,
    ) -> anyhow::Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE face_encodings SET name = ?1, age = ?2, gender = ?3 WHERE id = ?4",
            params![name, age, gender, id],
        )?;
        Ok(changed > 0)
    }

    pub fn delete_face(&self, id: i64) -> anyhow::Result<bool> {
        let conn = self.conn.lock();
        let image_path: Option<String> = conn
            .query_row(
                "SELECT image_path FROM face_encodings WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        if image_path.is_none() {
            return Ok(false);
        }
        conn.execute("DELETE FROM face_encodings WHERE id = ?1", params![id])?;
        Ok(true)
    }
}

/// Little-endian f32 blob
pub fn encode_embedding(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn decode_embedding(blob: &[u8]) -> Option<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return None;
    }
    Some(
        blob.chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(hour: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_opt(hour, min, 0)
            .unwrap()
    }

    #[test]
    fn recordings_are_listed_newest_first_and_filtered() {
        let log = EventLog::open_in_memory().unwrap();
        log.insert_recording("porch", Path::new("/clips/porch_a.avi"), at(8, 0), at(8, 1)).unwrap();
        log.insert_recording("yard", Path::new("/clips/yard_a.avi"), at(9, 0), at(9, 2)).unwrap();
        log.insert_recording("porch", Path::new("/clips/porch_b.avi"), at(10, 0), at(10, 5)).unwrap();

        let all = log.recent_recordings(None, 10).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].file_name, "porch_b.avi");
        assert_eq!(all[0].start_time, "2024-05-01 10:00:00");

        let porch = log.recent_recordings(Some("porch"), 1).unwrap();
        assert_eq!(porch.len(), 1);
        assert_eq!(porch[0].file_path, "/clips/porch_b.avi");
        assert_eq!(log.recording_count().unwrap(), 3);
    }

    #[test]
    fn faces_round_trip_through_blob() {
        let log = EventLog::open_in_memory().unwrap();
        let id = log
            .insert_face(&NewFace {
                name: "ana",
                age: Some(34),
                gender: None,
                encoding: &[0.25, -1.5, 3.0],
                image_path: "/faces/ana.jpg",
            })
            .unwrap();

        let faces = log.list_faces().unwrap();
        assert_eq!(faces.len(), 1);
        assert_eq!(faces[0].id, id);
        assert_eq!(faces[0].encoding, vec![0.25, -1.5, 3.0]);
        assert_eq!(faces[0].age, Some(34));

        assert!(log.update_face(id, "ana m.", Some(35), Some("f")).unwrap());
        let face = log.get_face(id).unwrap().unwrap();
        assert_eq!(face.name, "ana m.");
        assert_eq!(face.gender.as_deref(), Some("f"));

        assert!(log.delete_face(id).unwrap());
        assert!(!log.delete_face(id).unwrap());
        assert!(log.list_faces().unwrap().is_empty());
    }

    #[test]
    fn reopening_a_file_database_keeps_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db").join("vigil.db");
        {
            let log = EventLog::open(&path).unwrap();
            log.insert_recording("gate", Path::new("gate.avi"), at(1, 0), at(1, 1)).unwrap();
        }
        let log = EventLog::open(&path).unwrap();
        assert_eq!(log.recording_count().unwrap(), 1);
    }

    #[test]
    fn malformed_blob_is_rejected() {
        assert_eq!(decode_embedding(&[0, 0, 0]), None);
        assert_eq!(decode_embedding(&encode_embedding(&[1.0])), Some(vec![1.0]));
    }
}
