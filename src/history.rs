use crate::db;
use crate::options::DownloadOptions;
use crate::Result;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Meta key holding the whole history as one JSON array document.
pub const HISTORY_META_KEY: &str = "download_history";

/// Newest-first cap; upserts beyond this evict the oldest entries.
pub const HISTORY_CAPACITY: usize = 500;

const META_KEY_HISTORY_CAPACITY: &str = "history_capacity";

/// One finished (or stopped/failed) download as remembered across restarts.
/// Carries everything needed to resubmit the same request later.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: String,
    pub url: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub options: DownloadOptions,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub output_path: Option<PathBuf>,
    #[serde(default)]
    pub error_kind: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub log: String,
    #[serde(default)]
    pub created_at_ms: i64,
    #[serde(default)]
    pub finished_at_ms: Option<i64>,
}

/// Decodes the stored document element by element. Entries that no longer
/// decode are dropped instead of poisoning the whole history.
fn decode_entries(raw: &str) -> Vec<HistoryEntry> {
    let values: Vec<serde_json::Value> = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(_) => return Vec::new(),
    };
    values
        .into_iter()
        .filter_map(|v| serde_json::from_value(v).ok())
        .collect()
}

fn save(conn: &Connection, entries: &[HistoryEntry]) -> Result<()> {
    let json = serde_json::to_string(entries)?;
    db::set_meta(conn, HISTORY_META_KEY, &json)
}

/// Newest-first list of remembered downloads.
pub fn list(conn: &Connection) -> Result<Vec<HistoryEntry>> {
    match db::get_meta(conn, HISTORY_META_KEY)? {
        Some(raw) => Ok(decode_entries(&raw)),
        None => Ok(Vec::new()),
    }
}

/// Inserts the entry at the front, replacing any existing entry with the
/// same id. A retried job therefore keeps a single history row that moves
/// to the top with its latest outcome.
pub fn upsert(conn: &Connection, entry: HistoryEntry) -> Result<()> {
    let mut entries = list(conn)?;
    entries.retain(|e| e.id != entry.id);
    entries.insert(0, entry);
    entries.truncate(effective_capacity(conn)?);
    save(conn, &entries)
}

pub fn effective_capacity(conn: &Connection) -> Result<usize> {
    match db::get_meta(conn, META_KEY_HISTORY_CAPACITY)? {
        Some(v) => match v.trim().parse::<usize>() {
            Ok(parsed) => Ok(parsed.clamp(1, 10_000)),
            Err(_) => Ok(HISTORY_CAPACITY),
        },
        None => Ok(HISTORY_CAPACITY),
    }
}

/// Records the configured capacity unless one is already persisted, so a
/// restart with defaults never shrinks a store the user tuned.
pub fn seed_capacity(conn: &Connection, capacity: usize) -> Result<()> {
    if db::get_meta(conn, META_KEY_HISTORY_CAPACITY)?.is_none() {
        db::set_meta(
            conn,
            META_KEY_HISTORY_CAPACITY,
            &capacity.clamp(1, 10_000).to_string(),
        )?;
    }
    Ok(())
}

pub fn remove_by_id(conn: &Connection, id: &str) -> Result<()> {
    let mut entries = list(conn)?;
    entries.retain(|e| e.id != id);
    save(conn, &entries)
}

pub fn clear(conn: &Connection) -> Result<()> {
    save(conn, &[])
}

pub fn find_by_id(conn: &Connection, id: &str) -> Result<Option<HistoryEntry>> {
    Ok(list(conn)?.into_iter().find(|e| e.id == id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::AppPaths;

    fn test_conn() -> (tempfile::TempDir, Connection) {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = AppPaths::new(dir.path().to_path_buf());
        paths.ensure_dirs().expect("ensure dirs");
        let conn = db::open(&paths).expect("open");
        db::migrate(&conn).expect("migrate");
        (dir, conn)
    }

    fn entry(id: &str, title: &str) -> HistoryEntry {
        HistoryEntry {
            id: id.to_string(),
            url: format!("https://example.com/{id}"),
            title: Some(title.to_string()),
            options: DownloadOptions::default(),
            status: "completed".to_string(),
            progress: 1.0,
            output_path: Some(PathBuf::from(format!("/tmp/{id}.mp4"))),
            error_kind: None,
            error: None,
            log: String::new(),
            created_at_ms: 1_000,
            finished_at_ms: Some(2_000),
        }
    }

    #[test]
    fn upsert_prepends_and_replaces_same_id() {
        let (_dir, conn) = test_conn();
        upsert(&conn, entry("a", "first")).expect("upsert");
        upsert(&conn, entry("b", "second")).expect("upsert");
        let listed = list(&conn).expect("list");
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, "b");
        assert_eq!(listed[1].id, "a");

        upsert(&conn, entry("a", "retried")).expect("upsert");
        let listed = list(&conn).expect("list");
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, "a");
        assert_eq!(listed[0].title.as_deref(), Some("retried"));
    }

    #[test]
    fn capacity_evicts_oldest_entries() {
        let (_dir, conn) = test_conn();
        for i in 0..(HISTORY_CAPACITY + 5) {
            upsert(&conn, entry(&format!("id-{i}"), "t")).expect("upsert");
        }
        let listed = list(&conn).expect("list");
        assert_eq!(listed.len(), HISTORY_CAPACITY);
        assert_eq!(listed[0].id, format!("id-{}", HISTORY_CAPACITY + 4));
        assert!(listed.iter().all(|e| e.id != "id-0"));
    }

    #[test]
    fn remove_and_clear_persist() {
        let (_dir, conn) = test_conn();
        upsert(&conn, entry("a", "t")).expect("upsert");
        upsert(&conn, entry("b", "t")).expect("upsert");

        remove_by_id(&conn, "a").expect("remove");
        assert_eq!(find_by_id(&conn, "a").expect("find"), None);
        assert!(find_by_id(&conn, "b").expect("find").is_some());

        clear(&conn).expect("clear");
        assert!(list(&conn).expect("list").is_empty());
    }

    #[test]
    fn undecodable_elements_are_skipped() {
        let (_dir, conn) = test_conn();
        upsert(&conn, entry("keep", "t")).expect("upsert");
        let mut values: Vec<serde_json::Value> =
            serde_json::from_str(&db::get_meta(&conn, HISTORY_META_KEY).expect("get").expect("doc"))
                .expect("decode");
        values.push(serde_json::json!({"garbage": true}));
        db::set_meta(&conn, HISTORY_META_KEY, &serde_json::to_string(&values).expect("encode"))
            .expect("set");

        let listed = list(&conn).expect("list");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "keep");
    }
}
