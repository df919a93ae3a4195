use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use discovery_crypto::{CryptoError, Keystore, SealedBlob};
use serde_json::Value;
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

/// GCM appends a 16-byte authentication tag to the ciphertext; the CMDB
/// schema keeps it in its own column, so every sealed blob is split here.
const GCM_TAG_LEN: usize = 16;

/// Errors raised by CMDB operations.
#[derive(Debug, Error)]
pub enum CmdbError {
    /// Underlying SQL engine error.
    #[error("storage error: {0}")]
    Sql(#[from] sqlx::Error),
    /// AEAD seal/open failure.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
    /// `set`/`merge` referenced a `parent_key` that does not exist.
    #[error("parent key does not exist: {0}")]
    DanglingParent(String),
    /// No CI with this key exists.
    #[error("configuration item not found: {0}")]
    NotFound(String),
    /// No credential with this id exists.
    #[error("credential not found: {0}")]
    CredentialNotFound(String),
    /// Underlying filesystem I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A configuration item row (`spec.md` §3 "Configuration Item").
#[derive(Debug, Clone, PartialEq)]
pub struct CiRecord {
    /// Hierarchical key, e.g. `"ci:host:10.0.0.5"`.
    pub key: String,
    /// CI type, e.g. `"host"`, `"vm"`, `"interface"`.
    pub ci_type: String,
    /// Parent CI key, if this CI is nested under another.
    pub parent_key: Option<String>,
    /// Arbitrary attributes.
    pub attributes: Value,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last-modified timestamp.
    pub updated_at: DateTime<Utc>,
}

fn row_to_ci(row: &SqliteRow) -> Result<CiRecord, CmdbError> {
    let attributes: String = row.try_get("attributes")?;
    Ok(CiRecord {
        key: row.try_get("key")?,
        ci_type: row.try_get("type")?,
        parent_key: row.try_get("parent_key")?,
        attributes: serde_json::from_str(&attributes).unwrap_or(Value::Null),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Runtime statistics returned by `stats()`.
#[derive(Debug, Clone, Default)]
pub struct CmdbStats {
    /// Number of configuration items.
    pub ci_count: i64,
    /// Number of parent/child relationships.
    pub relationship_count: i64,
    /// Number of stored credentials.
    pub credential_count: i64,
}

/// The CMDB store. Cheap to clone (wraps an `Arc`-backed connection pool);
/// clones share the same background flush task.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
    keystore: Arc<RwLock<Keystore>>,
    flush_lock: Arc<Mutex<()>>,
}

impl Store {
    /// Open (creating if absent) the CMDB database at `db_path`, loading or
    /// creating the AEAD master key at `key_path`, and spawn the background
    /// flush task that fsyncs every 30s (`spec.md` §4.6).
    pub async fn open(db_path: &Path, key_path: &Path) -> Result<Self, CmdbError> {
        let url = format!("sqlite://{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS ci_items (
                key TEXT PRIMARY KEY,
                type TEXT NOT NULL,
                parent_key TEXT REFERENCES ci_items(key),
                attributes TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS ci_relationships (
                parent_key TEXT NOT NULL,
                child_key TEXT NOT NULL,
                relationship_type TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (parent_key, child_key, relationship_type)
            )",
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS credentials (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                ciphertext BLOB NOT NULL,
                iv BLOB NOT NULL,
                tag BLOB NOT NULL,
                created_at TEXT NOT NULL
            )",
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS keyring (
                id INTEGER PRIMARY KEY,
                wrapped_master_key BLOB NOT NULL
            )",
        )
        .execute(&pool)
        .await?;

        let keystore = Keystore::load_or_create(key_path)?;

        let store = Self {
            pool,
            keystore: Arc::new(RwLock::new(keystore)),
            flush_lock: Arc::new(Mutex::new(())),
        };
        store.spawn_background_flush();
        Ok(store)
    }

    /// In-memory store for unit tests; no flush task, no key file.
    #[cfg(any(test, feature = "test-util"))]
    pub async fn in_memory() -> Result<Self, CmdbError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        for ddl in [
            "CREATE TABLE ci_items (key TEXT PRIMARY KEY, type TEXT NOT NULL, parent_key TEXT, attributes TEXT NOT NULL DEFAULT '{}', created_at TEXT NOT NULL, updated_at TEXT NOT NULL)",
            "CREATE TABLE ci_relationships (parent_key TEXT NOT NULL, child_key TEXT NOT NULL, relationship_type TEXT NOT NULL, created_at TEXT NOT NULL, PRIMARY KEY (parent_key, child_key, relationship_type))",
            "CREATE TABLE credentials (id TEXT PRIMARY KEY, kind TEXT NOT NULL, ciphertext BLOB NOT NULL, iv BLOB NOT NULL, tag BLOB NOT NULL, created_at TEXT NOT NULL)",
            "CREATE TABLE keyring (id INTEGER PRIMARY KEY, wrapped_master_key BLOB NOT NULL)",
        ] {
            sqlx::query(ddl).execute(&pool).await?;
        }
        let keystore = Keystore::from_key_bytes(Keystore::generate_key().unwrap());
        Ok(Self {
            pool,
            keystore: Arc::new(RwLock::new(keystore)),
            flush_lock: Arc::new(Mutex::new(())),
        })
    }

    fn spawn_background_flush(&self) {
        let store = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(30));
            loop {
                interval.tick().await;
                if let Err(err) = store.save().await {
                    tracing::warn!(error = %err, "cmdb background flush failed");
                }
            }
        });
    }

    /// Fsync the database to disk. Called by the background writer every
    /// 30s and once more during graceful shutdown.
    pub async fn save(&self) -> Result<(), CmdbError> {
        let _guard = self.flush_lock.lock().await;
        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Fetch a CI by key.
    pub async fn get(&self, key: &str) -> Result<Option<CiRecord>, CmdbError> {
        let row = sqlx::query("SELECT * FROM ci_items WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_ci).transpose()
    }

    /// Upsert a CI. `updated_at` is always `now`; `created_at` is preserved
    /// across updates so it only ever moves forward in time (invariant:
    /// `updated_at >= created_at`, `spec.md` §3/§4.6).
    pub async fn set(
        &self,
        key: &str,
        ci_type: &str,
        parent_key: Option<&str>,
        attributes: Value,
    ) -> Result<CiRecord, CmdbError> {
        if let Some(parent) = parent_key {
            if self.get(parent).await?.is_none() {
                return Err(CmdbError::DanglingParent(parent.to_string()));
            }
        }

        let mut tx = self.pool.begin().await?;
        let now = Utc::now();
        let existing_created_at: Option<DateTime<Utc>> =
            sqlx::query_scalar("SELECT created_at FROM ci_items WHERE key = ?")
                .bind(key)
                .fetch_optional(&mut *tx)
                .await?;
        let created_at = existing_created_at.unwrap_or(now);
        let attrs_json = serde_json::to_string(&attributes).unwrap_or_else(|_| "{}".to_string());

        sqlx::query(
            "INSERT INTO ci_items (key, type, parent_key, attributes, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET
                type = excluded.type,
                parent_key = excluded.parent_key,
                attributes = excluded.attributes,
                updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(ci_type)
        .bind(parent_key)
        .bind(&attrs_json)
        .bind(created_at)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        if let Some(parent) = parent_key {
            sqlx::query(
                "INSERT OR IGNORE INTO ci_relationships (parent_key, child_key, relationship_type, created_at)
                 VALUES (?, ?, 'parent', ?)",
            )
            .bind(parent)
            .bind(key)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        self.get(key).await?.ok_or_else(|| CmdbError::NotFound(key.to_string()))
    }

    /// Shallow-merge `patch` into the CI's existing `attributes`.
    pub async fn merge(&self, key: &str, patch: Value) -> Result<CiRecord, CmdbError> {
        let existing = self.get(key).await?.ok_or_else(|| CmdbError::NotFound(key.to_string()))?;
        let mut merged = existing.attributes.clone();
        if let (Value::Object(base), Value::Object(delta)) = (&mut merged, &patch) {
            for (k, v) in delta {
                base.insert(k.clone(), v.clone());
            }
        } else {
            merged = patch;
        }
        self.set(key, &existing.ci_type, existing.parent_key.as_deref(), merged).await
    }

    /// Glob-query CI keys. `*` matches any run of characters; everything
    /// else is matched literally (`spec.md` §4.6 `query(pattern)`).
    pub async fn query(&self, pattern: &str) -> Result<Vec<CiRecord>, CmdbError> {
        let like_pattern = glob_to_like(pattern);
        let rows = sqlx::query("SELECT * FROM ci_items WHERE key LIKE ? ESCAPE '\\' ORDER BY key")
            .bind(like_pattern)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_ci).collect()
    }

    /// Delete every CI, relationship and credential. Used by tests and by
    /// operator-triggered resets; not exposed as an MCP tool by default.
    pub async fn clear(&self) -> Result<(), CmdbError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM ci_relationships").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM ci_items").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM credentials").execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Row counts across the three main tables.
    pub async fn stats(&self) -> Result<CmdbStats, CmdbError> {
        let ci_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM ci_items")
            .fetch_one(&self.pool)
            .await?;
        let relationship_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM ci_relationships")
            .fetch_one(&self.pool)
            .await?;
        let credential_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM credentials")
            .fetch_one(&self.pool)
            .await?;
        Ok(CmdbStats {
            ci_count,
            relationship_count,
            credential_count,
        })
    }

    /// Seal and store a credential's fields.
    pub async fn credentials_add(
        &self,
        id: &str,
        kind: &str,
        fields: &Value,
    ) -> Result<(), CmdbError> {
        let plaintext = serde_json::to_vec(fields).unwrap_or_default();
        let keystore = self.keystore.read().await;
        let blob = keystore.seal(&plaintext)?;
        let (ciphertext, tag) = split_tag(&blob.ciphertext);

        sqlx::query(
            "INSERT INTO credentials (id, kind, ciphertext, iv, tag, created_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET kind = excluded.kind, ciphertext = excluded.ciphertext,
                iv = excluded.iv, tag = excluded.tag",
        )
        .bind(id)
        .bind(kind)
        .bind(ciphertext)
        .bind(blob.nonce.to_vec())
        .bind(tag)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Decrypt and return a credential's fields.
    pub async fn credentials_get(&self, id: &str) -> Result<Value, CmdbError> {
        let row = sqlx::query("SELECT ciphertext, iv, tag FROM credentials WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| CmdbError::CredentialNotFound(id.to_string()))?;

        let ciphertext: Vec<u8> = row.try_get("ciphertext")?;
        let iv: Vec<u8> = row.try_get("iv")?;
        let tag: Vec<u8> = row.try_get("tag")?;
        let blob = rejoin_tag(iv, ciphertext, tag)?;

        let keystore = self.keystore.read().await;
        let plaintext = keystore.open(&blob)?;
        Ok(serde_json::from_slice(&plaintext).unwrap_or(Value::Null))
    }

    /// Re-wrap every stored credential under a new master key, atomically.
    /// On success the new key replaces the in-memory keystore and is
    /// persisted to `key_path`; the old ciphertext is overwritten in place,
    /// so it is never retained (`spec.md` §8 testable property 9).
    pub async fn rotate_key(&self, new_key_bytes: [u8; discovery_crypto::KEY_LEN], key_path: &Path) -> Result<(), CmdbError> {
        let new_keystore = Keystore::from_key_bytes(new_key_bytes);
        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query("SELECT id, ciphertext, iv, tag FROM credentials")
            .fetch_all(&mut *tx)
            .await?;

        let old_keystore = self.keystore.read().await;
        let mut resealed = Vec::with_capacity(rows.len());
        for row in &rows {
            let id: String = row.try_get("id")?;
            let ciphertext: Vec<u8> = row.try_get("ciphertext")?;
            let iv: Vec<u8> = row.try_get("iv")?;
            let tag: Vec<u8> = row.try_get("tag")?;
            let blob = rejoin_tag(iv, ciphertext, tag)?;
            let new_blob = old_keystore.reseal_for(&blob, &new_keystore)?;
            resealed.push((id, new_blob));
        }
        drop(old_keystore);

        for (id, blob) in resealed {
            let (ciphertext, tag) = split_tag(&blob.ciphertext);
            sqlx::query("UPDATE credentials SET ciphertext = ?, iv = ?, tag = ? WHERE id = ?")
                .bind(ciphertext)
                .bind(blob.nonce.to_vec())
                .bind(tag)
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        Keystore::persist_key(key_path, &new_key_bytes)?;
        *self.keystore.write().await = new_keystore;
        Ok(())
    }

    /// Import CIs from a directory of legacy JSON files (one CI per file,
    /// named `<key>.json` with an object body used as `attributes`). This
    /// is the one-time migration path from a pre-CMDB filesystem-backed
    /// deployment (`spec.md` §4.6 `migrate_from_filesystem()`).
    pub async fn migrate_from_filesystem(&self, dir: &Path) -> Result<usize, CmdbError> {
        let mut imported = 0usize;
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let body = tokio::fs::read_to_string(&path).await?;
            let attributes: Value = serde_json::from_str(&body).unwrap_or(Value::Object(Default::default()));
            self.set(stem, "legacy-import", None, attributes).await?;
            imported += 1;
        }
        Ok(imported)
    }
}

fn split_tag(ciphertext_with_tag: &[u8]) -> (Vec<u8>, Vec<u8>) {
    let split_at = ciphertext_with_tag.len().saturating_sub(GCM_TAG_LEN);
    (
        ciphertext_with_tag[..split_at].to_vec(),
        ciphertext_with_tag[split_at..].to_vec(),
    )
}

fn rejoin_tag(iv: Vec<u8>, ciphertext: Vec<u8>, tag: Vec<u8>) -> Result<SealedBlob, CmdbError> {
    if iv.len() != discovery_crypto::NONCE_LEN {
        return Err(CmdbError::NotFound("malformed credential nonce".to_string()));
    }
    let mut nonce = [0u8; discovery_crypto::NONCE_LEN];
    nonce.copy_from_slice(&iv);
    let mut combined = ciphertext;
    combined.extend_from_slice(&tag);
    Ok(SealedBlob {
        nonce,
        ciphertext: combined,
    })
}

fn glob_to_like(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len());
    for c in pattern.chars() {
        match c {
            '*' => out.push('%'),
            '%' | '_' | '\\' => {
                out.push('\\');
                out.push(c);
            }
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let store = Store::in_memory().await.unwrap();
        store.set("ci:host:10.0.0.1", "host", None, json!({"os": "linux"})).await.unwrap();
        let ci = store.get("ci:host:10.0.0.1").await.unwrap().unwrap();
        assert_eq!(ci.attributes["os"], "linux");
        assert!(ci.updated_at >= ci.created_at);
    }

    #[tokio::test]
    async fn merge_shallow_merges_attributes() {
        let store = Store::in_memory().await.unwrap();
        store.set("ci:host:a", "host", None, json!({"os": "linux", "cpu": 4})).await.unwrap();
        let merged = store.merge("ci:host:a", json!({"cpu": 8})).await.unwrap();
        assert_eq!(merged.attributes["cpu"], 8);
        assert_eq!(merged.attributes["os"], "linux");
    }

    #[tokio::test]
    async fn dangling_parent_is_rejected() {
        let store = Store::in_memory().await.unwrap();
        let err = store
            .set("ci:vm:a", "vm", Some("ci:host:missing"), json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, CmdbError::DanglingParent(_)));
    }

    #[tokio::test]
    async fn query_matches_glob() {
        let store = Store::in_memory().await.unwrap();
        store.set("ci:host:a", "host", None, json!({})).await.unwrap();
        store.set("ci:host:b", "host", None, json!({})).await.unwrap();
        store.set("ci:vm:a", "vm", None, json!({})).await.unwrap();
        let hosts = store.query("ci:host:*").await.unwrap();
        assert_eq!(hosts.len(), 2);
    }

    #[tokio::test]
    async fn credential_round_trips_and_rotates() {
        let store = Store::in_memory().await.unwrap();
        store
            .credentials_add("cred-1", "password", &json!({"username": "u", "password": "p"}))
            .await
            .unwrap();

        let before = store.credentials_get("cred-1").await.unwrap();
        assert_eq!(before["username"], "u");

        let dir = tempfile::tempdir().unwrap();
        let key_path = dir.path().join("key");
        let new_key = discovery_crypto::Keystore::generate_key().unwrap();
        store.rotate_key(new_key, &key_path).await.unwrap();

        let after = store.credentials_get("cred-1").await.unwrap();
        assert_eq!(after, before);
    }

    #[tokio::test]
    async fn stats_reports_counts() {
        let store = Store::in_memory().await.unwrap();
        store.set("ci:host:a", "host", None, json!({})).await.unwrap();
        store.credentials_add("c1", "password", &json!({"p": "x"})).await.unwrap();
        let stats = store.stats().await.unwrap();
        assert_eq!(stats.ci_count, 1);
        assert_eq!(stats.credential_count, 1);
    }

    #[tokio::test]
    async fn clear_removes_everything() {
        let store = Store::in_memory().await.unwrap();
        store.set("ci:host:a", "host", None, json!({})).await.unwrap();
        store.clear().await.unwrap();
        assert!(store.get("ci:host:a").await.unwrap().is_none());
    }
}
