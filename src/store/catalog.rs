//! Catalog: a rebuildable SQLite index over manifests.
//!
//! The catalog is a performance cache, never the source of truth. Every row
//! can be regenerated from the manifest tree with [`Catalog::rebuild`], and
//! callers treat any [`CatalogError`] as a signal to fall back to scanning
//! manifests.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::domain::{BlobHash, Manifest, ManifestId, RunId};
use crate::error::{CatalogError, Result, VaultError};

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS manifests (
    manifest_id  TEXT PRIMARY KEY,
    run_id       TEXT NOT NULL,
    url          TEXT NOT NULL,
    captured_at  TEXT NOT NULL,
    status       INTEGER,
    path         TEXT NOT NULL,
    primary_hash TEXT,
    total_bytes  INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_manifests_url ON manifests(url, captured_at);
CREATE INDEX IF NOT EXISTS idx_manifests_run ON manifests(run_id);

CREATE TABLE IF NOT EXISTS manifest_blobs (
    manifest_id TEXT NOT NULL REFERENCES manifests(manifest_id) ON DELETE CASCADE,
    position    INTEGER NOT NULL,
    hash        TEXT NOT NULL,
    relation    TEXT NOT NULL,
    PRIMARY KEY (manifest_id, position)
);
CREATE INDEX IF NOT EXISTS idx_manifest_blobs_hash ON manifest_blobs(hash);
"#;

const SELECT_REF: &str =
    "SELECT manifest_id, run_id, url, captured_at, status, path FROM manifests";

/// Pointer from a lookup result to a manifest on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestRef {
    pub manifest_id: ManifestId,
    pub run_id: RunId,
    pub url: String,
    pub timestamp: DateTime<Utc>,
    pub status: Option<u16>,
    pub path: PathBuf,
}

impl ManifestRef {
    pub fn from_manifest(manifest: &Manifest, path: &Path) -> Self {
        Self {
            manifest_id: manifest.manifest_id.clone(),
            run_id: manifest.run_id.clone(),
            url: manifest.url.clone(),
            timestamp: manifest.timestamp,
            status: manifest.status,
            path: path.to_path_buf(),
        }
    }

    /// Capture time, then manifest id
    pub fn sort(refs: &mut [ManifestRef]) {
        refs.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.manifest_id.cmp(&b.manifest_id))
        });
    }
}

/// SQLite-backed catalog.
///
/// Clones share one connection. A catalog opened with
/// [`Catalog::open_or_degraded`] may hold no connection at all; every query
/// then fails with `CatalogError::Unavailable` until [`Catalog::recreate`].
#[derive(Debug, Clone)]
pub struct Catalog {
    path: PathBuf,
    conn: Arc<Mutex<Option<Connection>>>,
}

impl Catalog {
    /// Open (or create) the catalog file and ensure the schema.
    /// A corrupt file surfaces here as a `CatalogError`.
    pub fn open(path: &Path) -> Result<Self, CatalogError> {
        let conn = connect(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            conn: Arc::new(Mutex::new(Some(conn))),
        })
    }

    /// Open the catalog, or hold it unavailable if the file cannot be used
    pub fn open_or_degraded(path: &Path) -> Self {
        let conn = match connect(path) {
            Ok(conn) => Some(conn),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Catalog unavailable, lookups will scan manifests");
                None
            }
        };
        Self {
            path: path.to_path_buf(),
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    /// A catalog that stays unavailable until [`Catalog::recreate`]
    pub fn unavailable(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            conn: Arc::new(Mutex::new(None)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_available(&self) -> bool {
        self.conn.lock().map(|guard| guard.is_some()).unwrap_or(false)
    }

    /// Close the connection after a failed write. The rows no longer match
    /// the manifest tree, so lookups scan until [`Catalog::recreate`].
    pub fn mark_stale(&self) {
        match self.conn.lock() {
            Ok(mut guard) => {
                if guard.take().is_some() {
                    warn!(path = %self.path.display(), "Catalog marked stale, lookups will scan manifests until it is rebuilt");
                }
            }
            Err(poisoned) => {
                poisoned.into_inner().take();
            }
        }
    }

    /// Delete the catalog file (and its WAL sidecars) and start empty
    pub async fn recreate(&self) -> Result<()> {
        let conn = Arc::clone(&self.conn);
        let path = self.path.clone();

        let result = tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| CatalogError::Unavailable("catalog connection poisoned".to_string()))?;

            // Close before unlinking
            guard.take();
            for suffix in ["", "-wal", "-shm"] {
                let file = PathBuf::from(format!("{}{}", path.display(), suffix));
                match std::fs::remove_file(&file) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => {
                        return Err(CatalogError::Unavailable(format!("{}: {}", file.display(), e)))
                    }
                }
            }

            *guard = Some(connect(&path)?);
            Ok(())
        })
        .await?;

        info!(path = %self.path.display(), "Recreated catalog");
        result.map_err(VaultError::from)
    }

    /// Run `f` against the connection on the blocking pool
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, CatalogError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let result = tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| CatalogError::Unavailable("catalog connection poisoned".to_string()))?;
            match guard.as_mut() {
                Some(conn) => f(conn),
                None => Err(CatalogError::Unavailable("catalog not open".to_string())),
            }
        })
        .await?;

        result.map_err(VaultError::from)
    }

    /// Insert a manifest and its blob references in one transaction.
    /// Re-registering the same manifest is a no-op.
    pub async fn register_manifest(&self, manifest: &Manifest, path: &Path) -> Result<()> {
        let manifest = manifest.clone();
        let path = path.to_path_buf();

        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            insert_manifest(&tx, &manifest, &path)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    /// All captures of a url, optionally scoped to a run, by capture time
    pub async fn find_by_url(&self, url: &str, run_id: Option<&RunId>) -> Result<Vec<ManifestRef>> {
        let url = url.to_string();
        let run_id = run_id.map(|r| r.as_str().to_string());

        self.with_conn(move |conn| {
            let mut refs = Vec::new();
            match run_id {
                Some(run_id) => {
                    let mut stmt = conn.prepare(&format!(
                        "{} WHERE url = ?1 AND run_id = ?2 ORDER BY captured_at, manifest_id",
                        SELECT_REF
                    ))?;
                    let rows = stmt.query_map(params![url, run_id], row_to_ref)?;
                    for row in rows {
                        refs.push(row??);
                    }
                }
                None => {
                    let mut stmt = conn.prepare(&format!(
                        "{} WHERE url = ?1 ORDER BY captured_at, manifest_id",
                        SELECT_REF
                    ))?;
                    let rows = stmt.query_map(params![url], row_to_ref)?;
                    for row in rows {
                        refs.push(row??);
                    }
                }
            }
            Ok(refs)
        })
        .await
    }

    /// Manifests referencing a blob, as primary body or asset
    pub async fn find_by_hash(&self, hash: &BlobHash) -> Result<Vec<ManifestRef>> {
        let hash = hash.to_string();

        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "{} WHERE manifest_id IN (SELECT manifest_id FROM manifest_blobs WHERE hash = ?1) \
                 ORDER BY captured_at, manifest_id",
                SELECT_REF
            ))?;
            let rows = stmt.query_map(params![hash], row_to_ref)?;

            let mut refs = Vec::new();
            for row in rows {
                refs.push(row??);
            }
            Ok(refs)
        })
        .await
    }

    /// Location of a manifest by id
    pub async fn manifest_path(&self, manifest_id: &ManifestId) -> Result<Option<PathBuf>> {
        let manifest_id = manifest_id.to_string();

        self.with_conn(move |conn| {
            let path: Option<String> = conn
                .query_row(
                    "SELECT path FROM manifests WHERE manifest_id = ?1",
                    params![manifest_id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(path.map(PathBuf::from))
        })
        .await
    }

    /// Distinct run ids, sorted
    pub async fn runs(&self) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT DISTINCT run_id FROM manifests ORDER BY run_id")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            let mut runs = Vec::new();
            for row in rows {
                runs.push(row?);
            }
            Ok(runs)
        })
        .await
    }

    /// Number of catalogued manifests
    pub async fn len(&self) -> Result<u64> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM manifests", [], |row| row.get(0))?;
            Ok(count as u64)
        })
        .await
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// Drop the rows of one run (retention)
    pub async fn remove_run(&self, run_id: &RunId) -> Result<usize> {
        let run_id = run_id.as_str().to_string();

        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM manifest_blobs WHERE manifest_id IN \
                 (SELECT manifest_id FROM manifests WHERE run_id = ?1)",
                params![run_id],
            )?;
            let removed = tx.execute("DELETE FROM manifests WHERE run_id = ?1", params![run_id])?;
            tx.commit()?;
            Ok(removed)
        })
        .await
    }

    /// Replace the whole catalog with rows built from `manifests`
    pub async fn rebuild(&self, manifests: Vec<(Manifest, PathBuf)>) -> Result<usize> {
        let count = manifests.len();

        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM manifest_blobs", [])?;
            tx.execute("DELETE FROM manifests", [])?;
            for (manifest, path) in &manifests {
                insert_manifest(&tx, manifest, path)?;
            }
            tx.commit()?;
            Ok(())
        })
        .await?;

        info!(manifests = count, "Rebuilt catalog");
        Ok(count)
    }
}

fn connect(path: &Path) -> Result<Connection, CatalogError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| CatalogError::Unavailable(format!("{}: {}", parent.display(), e)))?;
    }

    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    conn.execute_batch(SCHEMA)?;

    debug!(path = %path.display(), "Opened catalog");
    Ok(conn)
}

/// Fixed-width RFC 3339 so lexical order equals chronological order
fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn insert_manifest(
    tx: &rusqlite::Transaction<'_>,
    manifest: &Manifest,
    path: &Path,
) -> Result<(), CatalogError> {
    let inserted = tx.execute(
        "INSERT OR IGNORE INTO manifests \
         (manifest_id, run_id, url, captured_at, status, path, primary_hash, total_bytes) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            manifest.manifest_id.as_str(),
            manifest.run_id.as_str(),
            manifest.url,
            format_timestamp(&manifest.timestamp),
            manifest.status,
            path.to_string_lossy().into_owned(),
            manifest.primary_hash.as_ref().map(|h| h.as_str()),
            manifest.total_bytes as i64,
        ],
    )?;

    if inserted == 0 {
        return Ok(());
    }

    let mut stmt = tx.prepare(
        "INSERT INTO manifest_blobs (manifest_id, position, hash, relation) VALUES (?1, ?2, ?3, ?4)",
    )?;

    let mut position = 0i64;
    if let Some(ref primary) = manifest.primary_hash {
        stmt.execute(params![
            manifest.manifest_id.as_str(),
            position,
            primary.as_str(),
            "primary"
        ])?;
        position += 1;
    }
    for asset in &manifest.assets {
        stmt.execute(params![
            manifest.manifest_id.as_str(),
            position,
            asset.hash.as_str(),
            asset.relation.as_str()
        ])?;
        position += 1;
    }

    Ok(())
}

/// Map a row to a ManifestRef. The outer result carries SQLite errors,
/// the inner one rows whose values no longer parse.
fn row_to_ref(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<ManifestRef, CatalogError>> {
    let manifest_id: String = row.get(0)?;
    let run_id: String = row.get(1)?;
    let url: String = row.get(2)?;
    let captured_at: String = row.get(3)?;
    let status: Option<u16> = row.get(4)?;
    let path: String = row.get(5)?;

    Ok(parse_ref(manifest_id, run_id, url, &captured_at, status, path))
}

fn parse_ref(
    manifest_id: String,
    run_id: String,
    url: String,
    captured_at: &str,
    status: Option<u16>,
    path: String,
) -> Result<ManifestRef, CatalogError> {
    let corrupt = |what: &str| CatalogError::Unavailable(format!("corrupt catalog row: {}", what));

    Ok(ManifestRef {
        manifest_id: ManifestId::parse(&manifest_id).map_err(|_| corrupt("manifest_id"))?,
        run_id: RunId::new(run_id).map_err(|_| corrupt("run_id"))?,
        url,
        timestamp: DateTime::parse_from_rfc3339(captured_at)
            .map_err(|_| corrupt("captured_at"))?
            .with_timezone(&Utc),
        status,
        path: PathBuf::from(path),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AssetEntry, Relation, MANIFEST_VERSION};
    use chrono::Duration as ChronoDuration;
    use tempfile::TempDir;

    fn manifest(run: &str, url: &str, body: &[u8], offset_secs: i64) -> Manifest {
        let run_id = RunId::new(run).unwrap();
        Manifest {
            version: MANIFEST_VERSION,
            manifest_id: ManifestId::for_capture(&run_id, url),
            url: url.to_string(),
            run_id,
            timestamp: Utc::now() + ChronoDuration::seconds(offset_secs),
            status: Some(200),
            headers: Vec::new(),
            primary_hash: Some(BlobHash::of(body)),
            assets: vec![AssetEntry {
                url: format!("{}/style.css", url),
                hash: BlobHash::of(b"body{}"),
                relation: Relation::Stylesheet,
                byte_size: 6,
            }],
            total_bytes: body.len() as u64 + 6,
            fetch_duration_ms: 3,
            failure: None,
        }
    }

    #[tokio::test]
    async fn test_register_and_find_by_url() {
        let temp = TempDir::new().unwrap();
        let catalog = Catalog::open(&temp.path().join("catalog.sqlite")).unwrap();

        let later = manifest("r2", "https://a.example/", b"v2", 10);
        let earlier = manifest("r1", "https://a.example/", b"v1", 0);
        catalog
            .register_manifest(&later, Path::new("/m/r2.json"))
            .await
            .unwrap();
        catalog
            .register_manifest(&earlier, Path::new("/m/r1.json"))
            .await
            .unwrap();

        let refs = catalog.find_by_url("https://a.example/", None).await.unwrap();
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].manifest_id, earlier.manifest_id);
        assert_eq!(refs[0].timestamp, earlier.timestamp);
        assert_eq!(refs[1].manifest_id, later.manifest_id);

        let scoped = catalog
            .find_by_url("https://a.example/", Some(&RunId::new("r2").unwrap()))
            .await
            .unwrap();
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[0].path, PathBuf::from("/m/r2.json"));
    }

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let catalog = Catalog::open(&temp.path().join("catalog.sqlite")).unwrap();
        let m = manifest("r1", "https://a.example/", b"v1", 0);

        catalog.register_manifest(&m, Path::new("/m/a.json")).await.unwrap();
        catalog.register_manifest(&m, Path::new("/m/a.json")).await.unwrap();

        assert_eq!(catalog.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_find_by_hash_covers_assets() {
        let temp = TempDir::new().unwrap();
        let catalog = Catalog::open(&temp.path().join("catalog.sqlite")).unwrap();

        let a = manifest("r1", "https://a.example/", b"one", 0);
        let b = manifest("r1", "https://b.example/", b"two", 1);
        catalog.register_manifest(&a, Path::new("/m/a.json")).await.unwrap();
        catalog.register_manifest(&b, Path::new("/m/b.json")).await.unwrap();

        // Shared stylesheet
        let shared = catalog.find_by_hash(&BlobHash::of(b"body{}")).await.unwrap();
        assert_eq!(shared.len(), 2);

        let only_a = catalog.find_by_hash(&BlobHash::of(b"one")).await.unwrap();
        assert_eq!(only_a.len(), 1);
        assert_eq!(only_a[0].url, "https://a.example/");
    }

    #[tokio::test]
    async fn test_rebuild_replaces_rows() {
        let temp = TempDir::new().unwrap();
        let catalog = Catalog::open(&temp.path().join("catalog.sqlite")).unwrap();

        let stale = manifest("old", "https://stale.example/", b"x", 0);
        catalog.register_manifest(&stale, Path::new("/m/s.json")).await.unwrap();

        let fresh = manifest("r1", "https://a.example/", b"y", 0);
        let count = catalog
            .rebuild(vec![(fresh.clone(), PathBuf::from("/m/f.json"))])
            .await
            .unwrap();

        assert_eq!(count, 1);
        assert!(catalog
            .find_by_url("https://stale.example/", None)
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            catalog.manifest_path(&fresh.manifest_id).await.unwrap(),
            Some(PathBuf::from("/m/f.json"))
        );
        assert_eq!(catalog.runs().await.unwrap(), vec!["r1".to_string()]);
    }

    #[tokio::test]
    async fn test_stale_catalog_stops_answering() {
        let temp = TempDir::new().unwrap();
        let catalog = Catalog::open(&temp.path().join("catalog.sqlite")).unwrap();
        let m = manifest("r1", "https://a.example/", b"v1", 0);
        catalog.register_manifest(&m, Path::new("/m/a.json")).await.unwrap();

        let shared = catalog.clone();
        shared.mark_stale();
        assert!(!catalog.is_available());
        assert!(matches!(
            catalog.find_by_url("https://a.example/", None).await,
            Err(VaultError::Catalog(CatalogError::Unavailable(_)))
        ));

        catalog.recreate().await.unwrap();
        assert!(catalog.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_corrupt_file_degrades_then_recreates() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("catalog.sqlite");
        std::fs::write(&path, b"this is definitely not a sqlite database file....").unwrap();

        assert!(Catalog::open(&path).is_err());

        let catalog = Catalog::open_or_degraded(&path);
        assert!(!catalog.is_available());
        assert!(matches!(
            catalog.len().await,
            Err(VaultError::Catalog(CatalogError::Unavailable(_)))
        ));

        catalog.recreate().await.unwrap();
        assert!(catalog.is_available());
        assert_eq!(catalog.len().await.unwrap(), 0);
    }
}
