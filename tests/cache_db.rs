//! Tests for the persistent evaluation cache: schema migration, lookup
//! semantics and the value-persistence bandwidth gate.

use siftd::engine::attr::OBJ_DATA;
use siftd::engine::cache::{ObjectCache, OCACHE_DB_NAME};
use siftd::engine::object::ObjectData;
use siftd::engine::sig::Signature;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::Row;

async fn make_object(uri: &str, data: &[u8]) -> ObjectData {
    let mut obj = ObjectData::new(uri);
    obj.attrs.write(OBJ_DATA, data).unwrap();
    obj
}

#[tokio::test]
async fn fresh_database_initializes_to_version_2() {
    let dir = tempfile::tempdir().unwrap();
    let cache = ObjectCache::open(dir.path()).await.unwrap();
    assert!(cache.is_enabled());

    let version: i64 = sqlx::query_scalar("PRAGMA user_version")
        .fetch_one(cache.pool().unwrap())
        .await
        .unwrap();
    assert_eq!(version, 2);
}

#[tokio::test]
async fn version_1_database_is_upgraded_without_data_loss() {
    let dir = tempfile::tempdir().unwrap();

    // lay down a version-1 database: `confidence` instead of `score`, and
    // output values in a main-database attrs table
    {
        let options = SqliteConnectOptions::new()
            .filename(dir.path().join(OCACHE_DB_NAME))
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .unwrap();

        for stmt in [
            "CREATE TABLE cache (
                 cache_entry INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
                 object_sig  BLOB NOT NULL,
                 filter_sig  BLOB,
                 confidence  INTEGER NOT NULL,
                 create_time INTEGER,
                 elapsed_ms  INTEGER
             )",
            "CREATE INDEX object_filter_idx ON cache (object_sig, filter_sig)",
            "CREATE TABLE input_attrs (
                 cache_entry INTEGER NOT NULL,
                 name TEXT NOT NULL,
                 sig BLOB NOT NULL,
                 PRIMARY KEY (cache_entry, name)
             )",
            "CREATE TABLE output_attrs (
                 cache_entry INTEGER NOT NULL,
                 name TEXT NOT NULL,
                 sig BLOB NOT NULL,
                 PRIMARY KEY (cache_entry, name)
             )",
            "CREATE TABLE attrs (
                 name TEXT NOT NULL,
                 sig BLOB NOT NULL,
                 value BLOB NOT NULL,
                 PRIMARY KEY (sig, name)
             )",
            "PRAGMA user_version = 1",
        ] {
            sqlx::query(stmt).execute(&pool).await.unwrap();
        }

        let object_sig = Signature::hash_str("obj/old").0.to_vec();
        let filter_sig = Signature::hash_str("some-filter").0.to_vec();
        let value_sig = Signature::hash_bytes(b"cached value").0.to_vec();

        sqlx::query(
            "INSERT INTO cache (object_sig, filter_sig, confidence, create_time, elapsed_ms)
             VALUES (?1, ?2, 42, 1234, 7)",
        )
        .bind(object_sig)
        .bind(filter_sig)
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query("INSERT INTO output_attrs (cache_entry, name, sig) VALUES (1, 'out', ?1)")
            .bind(value_sig.clone())
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO attrs (name, sig, value) VALUES ('out', ?1, ?2)")
            .bind(value_sig)
            .bind(b"cached value".to_vec())
            .execute(&pool)
            .await
            .unwrap();

        pool.close().await;
    }

    let cache = ObjectCache::open(dir.path()).await.unwrap();
    assert!(cache.is_enabled());
    let pool = cache.pool().unwrap();

    let version: i64 = sqlx::query_scalar("PRAGMA user_version")
        .fetch_one(pool)
        .await
        .unwrap();
    assert_eq!(version, 2);

    let score: i64 = sqlx::query_scalar("SELECT score FROM cache WHERE filter_sig NOT NULL")
        .fetch_one(pool)
        .await
        .unwrap();
    assert_eq!(score, 42);

    // migration artifacts are gone
    for table in ["old_cache", "attrs"] {
        let n: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        )
        .bind(table)
        .fetch_one(pool)
        .await
        .unwrap();
        assert_eq!(n, 0, "table {table} should not survive the upgrade");
    }

    // the value blob moved into the attached database
    let value: Vec<u8> = sqlx::query_scalar("SELECT value FROM oattr.attrs WHERE name = 'out'")
        .fetch_one(pool)
        .await
        .unwrap();
    assert_eq!(value, b"cached value");
}

#[tokio::test]
async fn future_schema_version_disables_cache() {
    let dir = tempfile::tempdir().unwrap();
    {
        let options = SqliteConnectOptions::new()
            .filename(dir.path().join(OCACHE_DB_NAME))
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .unwrap();
        sqlx::query("PRAGMA user_version = 3")
            .execute(&pool)
            .await
            .unwrap();
        pool.close().await;
    }

    let cache = ObjectCache::open(dir.path()).await.unwrap();
    assert!(!cache.is_enabled());

    // disabled cache answers without storing anything
    let obj = make_object("obj/x", b"body").await;
    cache.add_initial(&obj).await.unwrap();
    assert!(cache
        .lookup(&obj.id_sig, &Signature::hash_str("f"))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn baseline_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let cache = ObjectCache::open(dir.path()).await.unwrap();

    let obj = make_object("obj/a", b"hello").await;
    cache.add_initial(&obj).await.unwrap();
    cache.add_initial(&obj).await.unwrap();

    let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM cache WHERE filter_sig ISNULL")
        .fetch_one(cache.pool().unwrap())
        .await
        .unwrap();
    assert_eq!(n, 1);
}

#[tokio::test]
async fn lookup_requires_matching_input_context() {
    let dir = tempfile::tempdir().unwrap();
    let cache = ObjectCache::open(dir.path()).await.unwrap();
    let fsig = Signature::hash_str("filter");

    let mut obj = make_object("obj/a", b"hello").await;
    obj.attrs.write("color", b"red").unwrap();
    cache.add_initial(&obj).await.unwrap();
    cache.reset_current(&obj.id_sig).await.unwrap();

    assert!(cache.lookup(&obj.id_sig, &fsig).await.unwrap().is_none());

    // record one execution that read "color" and wrote "verdict"
    cache.exec_begin().await.unwrap();
    cache
        .on_iattr("color", &obj.attrs.sig_of("color").unwrap())
        .await
        .unwrap();
    obj.attrs.write("verdict", b"ok").unwrap();
    cache
        .on_oattr("verdict", &obj.attrs.sig_of("verdict").unwrap(), 2)
        .await
        .unwrap();
    cache.exec_end(&obj, &fsig, 7, 3).await.unwrap();

    // same context: hit with the recorded score
    cache.reset_current(&obj.id_sig).await.unwrap();
    let hit = cache.lookup(&obj.id_sig, &fsig).await.unwrap().unwrap();
    assert_eq!(hit.score, 7);

    // the cached outputs merge into the live attribute set
    cache.combine(hit.entry).await.unwrap();
    let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM current_attrs WHERE name = 'verdict'")
        .fetch_one(cache.pool().unwrap())
        .await
        .unwrap();
    assert_eq!(n, 1);

    // perturb the input attribute the execution depended on: no hit
    cache.reset_current(&obj.id_sig).await.unwrap();
    sqlx::query("UPDATE current_attrs SET sig = ?1 WHERE name = 'color'")
        .bind(Signature::hash_bytes(b"green").0.to_vec())
        .execute(cache.pool().unwrap())
        .await
        .unwrap();
    assert!(cache.lookup(&obj.id_sig, &fsig).await.unwrap().is_none());
}

#[tokio::test]
async fn exec_begin_rejects_stale_state() {
    let dir = tempfile::tempdir().unwrap();
    let cache = ObjectCache::open(dir.path()).await.unwrap();

    cache.exec_begin().await.unwrap();
    cache
        .on_oattr("x", &Signature::hash_bytes(b"v"), 1)
        .await
        .unwrap();
    assert!(cache.exec_begin().await.is_err());

    // exec_end clears the transient tables even for an empty execution
    let obj = make_object("obj/a", b"x").await;
    cache
        .exec_end(&obj, &Signature::hash_str("f"), 1, 1)
        .await
        .unwrap();
    cache.exec_begin().await.unwrap();
}

#[tokio::test]
async fn large_slow_to_read_outputs_are_not_persisted() {
    let dir = tempfile::tempdir().unwrap();
    let cache = ObjectCache::open(dir.path()).await.unwrap();
    let fsig = Signature::hash_str("blobby");

    // 10 MB produced in 5 ms: re-executing beats reading it back
    let mut obj = make_object("obj/a", b"x").await;
    obj.attrs.write("huge", b"stand-in").unwrap();
    cache.exec_begin().await.unwrap();
    cache
        .on_oattr("huge", &obj.attrs.sig_of("huge").unwrap(), 10_000_000)
        .await
        .unwrap();
    cache.exec_end(&obj, &fsig, 50, 5).await.unwrap();

    let pool = cache.pool().unwrap();
    let values: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM oattr.attrs")
        .fetch_one(pool)
        .await
        .unwrap();
    assert_eq!(values, 0, "expensive-to-read value must not be stored");

    // the entry and its signature references still exist
    let rows = sqlx::query("SELECT cache_entry FROM cache WHERE filter_sig = ?1")
        .bind(fsig.0.to_vec())
        .fetch_all(pool)
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    let entry: i64 = rows[0].get(0);
    let outs: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM output_attrs WHERE cache_entry = ?1")
        .bind(entry)
        .fetch_one(pool)
        .await
        .unwrap();
    assert_eq!(outs, 1);
}

#[tokio::test]
async fn small_slow_outputs_are_persisted_and_read_back() {
    let dir = tempfile::tempdir().unwrap();
    let cache = ObjectCache::open(dir.path()).await.unwrap();
    let fsig = Signature::hash_str("expensive");

    // a few bytes produced in 200 ms: cheap to read back later
    let mut obj = make_object("obj/a", b"x").await;
    obj.attrs.write("tag", b"positive").unwrap();
    cache.exec_begin().await.unwrap();
    cache
        .on_oattr("tag", &obj.attrs.sig_of("tag").unwrap(), 8)
        .await
        .unwrap();
    cache.exec_end(&obj, &fsig, 90, 200).await.unwrap();

    let entry: i64 = sqlx::query_scalar("SELECT cache_entry FROM cache WHERE filter_sig = ?1")
        .bind(fsig.0.to_vec())
        .fetch_one(cache.pool().unwrap())
        .await
        .unwrap();

    let mut restored = ObjectData::new("obj/a");
    assert!(cache.read_oattrs(&mut restored.attrs, entry).await.unwrap());
    assert_eq!(restored.attrs.read("tag").unwrap(), b"positive");
}
