//! Persistent evaluation cache.
//!
//! Two SQLite databases in the cache directory: `ocache.db` holds the cache
//! entries plus the input/output attribute-signature sets, and `oattr.db`
//! (attached as `oattr`) holds actual output values keyed by attribute
//! signature. Three temp tables track the live state of the object under
//! evaluation: `current_attrs` is the attribute-signature set the object has
//! right now, and `temp_iattrs`/`temp_oattrs` collect what the running
//! filter read and wrote.
//!
//! A lookup hit is sound because the filter signature covers code, arguments
//! and blob, and the hit requires every recorded input attribute to match
//! the object's current signature for that name: same code, same inputs,
//! same outputs.
//!
//! Any setup failure disables the cache; evaluation continues uncached.

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Row, Sqlite};
use tracing::{debug, error, info, instrument, warn};

use super::attr::AttributeStore;
use super::error::EngineError;
use super::object::ObjectData;
use super::sig::Signature;

pub const OCACHE_DB_NAME: &str = "ocache.db";
pub const OATTR_DB_NAME: &str = "oattr.db";

/// Assumed bandwidth for reading attribute values back from the cache,
/// bytes per second. Values that would take longer to read than their
/// filter took to compute are not worth persisting.
pub const ESTIMATED_ATTR_READ_BW: i64 = 1024 * 1024;

const SCHEMA_VERSION: i64 = 2;

#[derive(Debug, Clone, Copy)]
pub struct CacheHit {
    pub entry: i64,
    pub score: i64,
    pub create_time: i64,
}

pub struct ObjectCache {
    db: Option<Pool<Sqlite>>,
    /// Serializes whole evaluation contexts. The temp tables describe one
    /// object at a time; every reset_current..exec_end sequence must hold
    /// this across all of its statements.
    context: tokio::sync::Mutex<()>,
}

impl ObjectCache {
    /// Open (or create) the cache databases under `dir`. Schema problems
    /// and unrecognized versions disable the cache rather than failing the
    /// session.
    pub async fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir).map_err(|e| {
            EngineError::Fatal(format!("failed to create cache dir {}: {e}", dir.display()))
        })?;

        match Self::setup(dir).await {
            Ok(pool) => {
                info!("object cache ready at {}", dir.display());
                Ok(ObjectCache {
                    db: Some(pool),
                    context: tokio::sync::Mutex::new(()),
                })
            }
            Err(e) => {
                error!("cache initialization failed, disabling cache: {e:#}");
                Ok(ObjectCache {
                    db: None,
                    context: tokio::sync::Mutex::new(()),
                })
            }
        }
    }

    /// A cache that satisfies the interface but stores nothing.
    pub fn disabled() -> Self {
        ObjectCache {
            db: None,
            context: tokio::sync::Mutex::new(()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.db.is_some()
    }

    /// Take exclusive use of the evaluation context (the transient tables).
    /// Hold the guard from `reset_current` through the final `exec_end` or
    /// `combine` of one object's walk.
    pub async fn lock_context(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.context.lock().await
    }

    async fn setup(dir: &Path) -> Result<Pool<Sqlite>> {
        let options = SqliteConnectOptions::new()
            .filename(dir.join(OCACHE_DB_NAME))
            .create_if_missing(true)
            .synchronous(SqliteSynchronous::Off)
            .busy_timeout(Duration::from_secs(30))
            .pragma("temp_store", "MEMORY");

        // The temp tables live on a connection; a single pinned connection
        // keeps every statement of an evaluation on that connection. The
        // pool must never recycle it or the temp tables vanish.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let oattr_path = dir.join(OATTR_DB_NAME).to_string_lossy().into_owned();
        sqlx::query("ATTACH ?1 AS oattr")
            .bind(oattr_path)
            .execute(&pool)
            .await?;

        let version: i64 = sqlx::query_scalar("PRAGMA user_version")
            .fetch_one(&pool)
            .await?;

        let mut tx = pool.begin().await?;

        match version {
            0 => info!("initializing new cache database"),
            1 => {
                info!("upgrading cache database from version 1");
                // move the table that needs rebuilding aside
                sqlx::query("DROP INDEX object_filter_idx")
                    .execute(&mut *tx)
                    .await?;
                sqlx::query("ALTER TABLE cache RENAME TO old_cache")
                    .execute(&mut *tx)
                    .await?;
            }
            SCHEMA_VERSION => debug!("cache database up to date"),
            v => {
                return Err(
                    EngineError::Corruption(format!("unrecognized ocache.db version {v}")).into(),
                )
            }
        }

        for stmt in [
            "CREATE TABLE IF NOT EXISTS cache (
                 cache_entry INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
                 object_sig  BLOB NOT NULL,
                 filter_sig  BLOB,
                 score       INTEGER NOT NULL,
                 create_time INTEGER,
                 elapsed_ms  INTEGER
             )",
            "CREATE TABLE IF NOT EXISTS input_attrs (
                 cache_entry INTEGER NOT NULL,
                 name        TEXT NOT NULL,
                 sig         BLOB NOT NULL,
                 PRIMARY KEY (cache_entry, name)
             )",
            "CREATE TABLE IF NOT EXISTS output_attrs (
                 cache_entry INTEGER NOT NULL,
                 name        TEXT NOT NULL,
                 sig         BLOB NOT NULL,
                 PRIMARY KEY (cache_entry, name)
             )",
            "CREATE TABLE IF NOT EXISTS oattr.attrs (
                 name  TEXT NOT NULL,
                 sig   BLOB NOT NULL,
                 value BLOB NOT NULL,
                 PRIMARY KEY (sig, name)
             )",
        ] {
            sqlx::query(stmt).execute(&mut *tx).await?;
        }

        // with the new tables in place, migrate data out of the old schema
        if version == 1 {
            sqlx::query(
                "INSERT INTO cache SELECT cache_entry, object_sig, filter_sig,
                     confidence, create_time, elapsed_ms FROM old_cache",
            )
            .execute(&mut *tx)
            .await?;
            sqlx::query("DROP TABLE old_cache").execute(&mut *tx).await?;
            sqlx::query(
                "INSERT OR IGNORE INTO oattr.attrs SELECT output_attrs.name, sig, value
                     FROM output_attrs JOIN attrs USING(sig)",
            )
            .execute(&mut *tx)
            .await?;
            sqlx::query("DROP TABLE attrs").execute(&mut *tx).await?;
            info!("cache schema upgraded");
        }

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS object_filter_idx
                 ON cache (object_sig, filter_sig)",
        )
        .execute(&mut *tx)
        .await?;
        sqlx::query(&format!("PRAGMA user_version = {SCHEMA_VERSION}"))
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        for stmt in [
            "CREATE TEMP TABLE current_attrs (
                 name TEXT PRIMARY KEY NOT NULL,
                 sig  BLOB NOT NULL
             )",
            "CREATE TEMP TABLE temp_iattrs (
                 name TEXT PRIMARY KEY NOT NULL,
                 sig  BLOB NOT NULL
             )",
            "CREATE TEMP TABLE temp_oattrs (
                 name   TEXT PRIMARY KEY NOT NULL,
                 sig    BLOB NOT NULL,
                 length INTEGER
             )",
        ] {
            sqlx::query(stmt).execute(&pool).await?;
        }

        Ok(pool)
    }

    /// Most recent entry for (object, filter) whose recorded input
    /// attributes all match the object's current attribute signatures.
    #[instrument(skip(self), level = "debug")]
    pub async fn lookup(
        &self,
        object_sig: &Signature,
        filter_sig: &Signature,
    ) -> Result<Option<CacheHit>> {
        let Some(db) = &self.db else { return Ok(None) };

        let row = sqlx::query(
            "SELECT cache_entry, score, create_time FROM cache
              WHERE object_sig = ?1 AND filter_sig = ?2 AND
              cache_entry NOT IN (SELECT cache_entry
                FROM cache JOIN input_attrs USING(cache_entry)
                LEFT OUTER JOIN current_attrs USING(name, sig)
                WHERE object_sig = ?1 AND filter_sig = ?2 AND
                current_attrs.name ISNULL)
              ORDER BY cache_entry DESC LIMIT 1",
        )
        .bind(object_sig.as_bytes().to_vec())
        .bind(filter_sig.as_bytes().to_vec())
        .fetch_optional(db)
        .await?;

        Ok(row.map(|r| CacheHit {
            entry: r.get(0),
            score: r.get(1),
            create_time: r.try_get(2).unwrap_or(0),
        }))
    }

    /// Commit the cached effect of a filter to the live attribute set
    /// without executing it.
    pub async fn combine(&self, entry: i64) -> Result<()> {
        let Some(db) = &self.db else { return Ok(()) };

        sqlx::query(
            "INSERT OR REPLACE INTO current_attrs (name, sig)
               SELECT name, sig FROM output_attrs
               WHERE cache_entry = ?1",
        )
        .bind(entry)
        .execute(db)
        .await?;
        Ok(())
    }

    /// Reconstruct a prior evaluation's output attributes into `attrs`.
    /// Returns false when any value is missing from the value store; in
    /// that case nothing is written.
    pub async fn read_oattrs(&self, attrs: &mut AttributeStore, entry: i64) -> Result<bool> {
        let Some(db) = &self.db else { return Ok(false) };

        let rows = sqlx::query(
            "SELECT output_attrs.name AS name, value
               FROM output_attrs LEFT JOIN oattr.attrs USING(sig)
               WHERE cache_entry = ?1",
        )
        .bind(entry)
        .fetch_all(db)
        .await?;

        if rows.is_empty() {
            return Ok(false);
        }

        let mut values = Vec::with_capacity(rows.len());
        for row in rows {
            let name: String = row.get("name");
            match row.try_get::<Option<Vec<u8>>, _>("value")? {
                Some(value) => values.push((name, value)),
                None => return Ok(false),
            }
        }

        for (name, value) in values {
            attrs
                .write(&name, &value)
                .map_err(|e| anyhow::anyhow!("restoring cached attribute: {e}"))?;
        }
        Ok(true)
    }

    /// Clear the live attribute set and seed it from the object's baseline
    /// entry. Called at the start of each object evaluation.
    #[instrument(skip(self), level = "debug")]
    pub async fn reset_current(&self, object_sig: &Signature) -> Result<()> {
        let Some(db) = &self.db else { return Ok(()) };

        let mut tx = db.begin().await?;
        sqlx::query("DELETE FROM current_attrs")
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT OR REPLACE INTO current_attrs (name, sig)
               SELECT name, sig FROM cache JOIN output_attrs
               USING(cache_entry)
               WHERE object_sig = ?1 AND filter_sig ISNULL",
        )
        .bind(object_sig.as_bytes().to_vec())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Record the object's initial attribute signatures as its baseline
    /// (filter_sig NULL) entry. Idempotent: at most one baseline per object.
    pub async fn add_initial(&self, obj: &ObjectData) -> Result<()> {
        let Some(db) = &self.db else { return Ok(()) };
        if obj.attrs.is_empty() {
            return Ok(());
        }

        let mut tx = db.begin().await?;

        let have: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM cache WHERE
               object_sig = ?1 AND filter_sig ISNULL",
        )
        .bind(obj.id_sig.as_bytes().to_vec())
        .fetch_one(&mut *tx)
        .await?;
        if have > 0 {
            return Ok(());
        }

        let result = sqlx::query(
            "INSERT INTO cache
               (object_sig, score, create_time, elapsed_ms)
               VALUES (?1, 1, ?2, 0)",
        )
        .bind(obj.id_sig.as_bytes().to_vec())
        .bind(chrono::Utc::now().timestamp())
        .execute(&mut *tx)
        .await?;
        let entry = result.last_insert_rowid();

        for (name, _value, sig) in obj.attrs.iter(false) {
            sqlx::query(
                "INSERT OR REPLACE INTO output_attrs (cache_entry, name, sig)
                   VALUES (?1, ?2, ?3)",
            )
            .bind(entry)
            .bind(name)
            .bind(sig.as_bytes().to_vec())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Concurrent filter executions against one evaluation context are not
    /// supported; the temp tables must be empty at execution start.
    pub async fn exec_begin(&self) -> Result<()> {
        let Some(db) = &self.db else { return Ok(()) };

        for table in ["temp_iattrs", "temp_oattrs"] {
            let n: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
                .fetch_one(db)
                .await?;
            if n != 0 {
                return Err(EngineError::Fatal(format!(
                    "filter execution started with {n} stale rows in {table}"
                ))
                .into());
            }
        }
        Ok(())
    }

    /// Record that the running filter read an attribute.
    pub async fn on_iattr(&self, name: &str, sig: &Signature) -> Result<()> {
        let Some(db) = &self.db else { return Ok(()) };
        sqlx::query("INSERT OR REPLACE INTO temp_iattrs (name, sig) VALUES (?1, ?2)")
            .bind(name)
            .bind(sig.as_bytes().to_vec())
            .execute(db)
            .await?;
        Ok(())
    }

    /// Record that the running filter wrote an attribute.
    pub async fn on_oattr(&self, name: &str, sig: &Signature, length: i64) -> Result<()> {
        let Some(db) = &self.db else { return Ok(()) };
        sqlx::query("INSERT OR REPLACE INTO temp_oattrs (name, sig, length) VALUES (?1, ?2, ?3)")
            .bind(name)
            .bind(sig.as_bytes().to_vec())
            .bind(length)
            .execute(db)
            .await?;
        Ok(())
    }

    /// Persist one filter execution: the cache row, its input/output
    /// attribute sets, and (when cheap enough to read back later) the output
    /// values themselves. The temp tables are cleared whether or not the
    /// transaction commits.
    #[instrument(skip(self, obj), level = "debug")]
    pub async fn exec_end(
        &self,
        obj: &ObjectData,
        filter_sig: &Signature,
        score: i64,
        elapsed_ms: i64,
    ) -> Result<()> {
        let Some(db) = &self.db else { return Ok(()) };

        let result = self.exec_end_txn(db, obj, filter_sig, score, elapsed_ms).await;
        if let Err(e) = &result {
            warn!("cache record failed, rolling back: {e:#}");
        }

        for table in ["temp_iattrs", "temp_oattrs"] {
            if let Err(e) = sqlx::query(&format!("DELETE FROM {table}")).execute(db).await {
                warn!("failed to clear {table}: {e}");
            }
        }
        result
    }

    async fn exec_end_txn(
        &self,
        db: &Pool<Sqlite>,
        obj: &ObjectData,
        filter_sig: &Signature,
        score: i64,
        elapsed_ms: i64,
    ) -> Result<()> {
        let mut tx = db.begin().await?;

        let result = sqlx::query(
            "INSERT INTO cache
               (object_sig, filter_sig, score, create_time, elapsed_ms)
               VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(obj.id_sig.as_bytes().to_vec())
        .bind(filter_sig.as_bytes().to_vec())
        .bind(score)
        .bind(chrono::Utc::now().timestamp())
        .bind(elapsed_ms)
        .execute(&mut *tx)
        .await?;
        let entry = result.last_insert_rowid();

        sqlx::query(
            "INSERT OR REPLACE INTO input_attrs (cache_entry, name, sig)
               SELECT ?1, name, sig FROM temp_iattrs",
        )
        .bind(entry)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT OR REPLACE INTO output_attrs (cache_entry, name, sig)
               SELECT ?1, name, sig FROM temp_oattrs",
        )
        .bind(entry)
        .execute(&mut *tx)
        .await?;

        // keep the live attribute set current so the next filter's lookup
        // matches against what this execution actually produced
        sqlx::query(
            "INSERT OR REPLACE INTO current_attrs (name, sig)
               SELECT name, sig FROM temp_oattrs",
        )
        .execute(&mut *tx)
        .await?;

        let oattr_size: i64 =
            sqlx::query_scalar("SELECT COALESCE(SUM(length), 0) FROM temp_oattrs")
                .fetch_one(&mut *tx)
                .await?;

        // persist values only when reading them back later beats
        // re-executing the filter
        if oattr_size * 1000 < ESTIMATED_ATTR_READ_BW * elapsed_ms {
            let rows = sqlx::query("SELECT name, sig FROM temp_oattrs")
                .fetch_all(&mut *tx)
                .await?;
            for row in rows {
                let name: String = row.get(0);
                let sig_bytes: Vec<u8> = row.get(1);

                // the attribute may have been rewritten since; only store
                // values whose signature still matches
                let live_sig = obj.attrs.sig_of(&name);
                if live_sig.map(|s| s.as_bytes().to_vec()) != Some(sig_bytes.clone()) {
                    continue;
                }
                let Some(value) = obj.attrs.peek(&name) else { continue };

                sqlx::query(
                    "INSERT OR IGNORE INTO oattr.attrs
                       (name, sig, value) VALUES (?1, ?2, ?3)",
                )
                .bind(name)
                .bind(sig_bytes)
                .bind(value.to_vec())
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    /// Direct pool access for integration tests.
    #[doc(hidden)]
    pub fn pool(&self) -> Option<&Pool<Sqlite>> {
        self.db.as_ref()
    }
}
