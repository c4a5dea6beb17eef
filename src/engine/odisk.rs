//! The object disk: an asynchronous producer pipeline turning group ids
//! into evaluable objects.
//!
//! One scope-producer task per gid streams object names into a bounded name
//! queue. A loader task fetches each object, builds its attribute set,
//! records its baseline in the cache and runs the cached pre-screen;
//! survivors land on the bounded evaluable queue that `next_obj` consumes.
//! Both queues are size 32, so a stalled consumer backpressures all the way
//! into the retriever's TCP reads.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use super::attr::{DEVICE_NAME, DISPLAY_NAME, OBJ_DATA, OBJ_ID, OBJ_URI};
use super::cache::ObjectCache;
use super::ceval::{CacheEval, Preflight};
use super::error::EngineError;
use super::object::ObjectData;
use super::retriever::{DataRetriever, ScopeEvent};
use super::stats::SessionCounters;

pub const OBJ_RING_SIZE: usize = 32;
pub const OBJ_PR_RING_SIZE: usize = 32;
pub const MAX_GID_FILTER: usize = 64;

pub struct ObjectDisk {
    retriever: Arc<DataRetriever>,
    cache: Arc<ObjectCache>,
    ceval: Arc<CacheEval>,
    counters: Arc<SessionCounters>,
    device_name: String,

    gids: Mutex<Vec<u64>>,
    search_active: Arc<AtomicBool>,
    count: Arc<AtomicI64>,
    search_id: AtomicU32,
    obj_rx: tokio::sync::Mutex<Option<mpsc::Receiver<ObjectData>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ObjectDisk {
    pub fn new(
        retriever: Arc<DataRetriever>,
        cache: Arc<ObjectCache>,
        ceval: Arc<CacheEval>,
        counters: Arc<SessionCounters>,
        device_name: String,
    ) -> Self {
        ObjectDisk {
            retriever,
            cache,
            ceval,
            counters,
            device_name,
            gids: Mutex::new(Vec::new()),
            search_active: Arc::new(AtomicBool::new(false)),
            count: Arc::new(AtomicI64::new(0)),
            search_id: AtomicU32::new(0),
            obj_rx: tokio::sync::Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Add a group id to the scope. Only valid while no search is running.
    pub fn set_gid(&self, gid: u64) -> Result<(), EngineError> {
        if self.search_active.load(Ordering::SeqCst) {
            return Err(EngineError::InvalidInput(
                "cannot change scope during an active search".to_string(),
            ));
        }
        let mut gids = self.gids.lock().unwrap();
        if gids.contains(&gid) {
            return Ok(());
        }
        if gids.len() >= MAX_GID_FILTER {
            return Err(EngineError::InvalidInput(format!(
                "scope limited to {MAX_GID_FILTER} group ids"
            )));
        }
        gids.push(gid);
        Ok(())
    }

    pub fn clear_gids(&self) -> Result<(), EngineError> {
        if self.search_active.load(Ordering::SeqCst) {
            return Err(EngineError::InvalidInput(
                "cannot change scope during an active search".to_string(),
            ));
        }
        self.gids.lock().unwrap().clear();
        Ok(())
    }

    /// Running estimate of objects remaining in scope.
    pub fn count(&self) -> i64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn search_id(&self) -> u32 {
        self.search_id.load(Ordering::Relaxed)
    }

    /// Abort any prior search and start scope-list fetches for every active
    /// gid.
    #[instrument(skip(self))]
    pub async fn reset(&self, search_id: u32) {
        self.flush().await;

        self.search_id.store(search_id, Ordering::SeqCst);
        self.count.store(0, Ordering::SeqCst);
        self.search_active.store(true, Ordering::SeqCst);

        let (name_tx, name_rx) = mpsc::channel::<ScopeEvent>(OBJ_PR_RING_SIZE);
        let (obj_tx, obj_rx) = mpsc::channel::<ObjectData>(OBJ_RING_SIZE);
        *self.obj_rx.lock().await = Some(obj_rx);

        let gids = self.gids.lock().unwrap().clone();
        info!(search_id, gids = gids.len(), "object disk reset");

        let mut tasks = self.tasks.lock().unwrap();
        for gid in gids {
            let retriever = self.retriever.clone();
            let tx = name_tx.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = retriever.fetch_scopelist(gid, tx).await {
                    warn!(gid, "scope list fetch failed: {e:#}");
                }
            }));
        }
        drop(name_tx);

        let loader = Loader {
            retriever: self.retriever.clone(),
            cache: self.cache.clone(),
            ceval: self.ceval.clone(),
            counters: self.counters.clone(),
            device_name: self.device_name.clone(),
            active: self.search_active.clone(),
            count: self.count.clone(),
        };
        tasks.push(tokio::spawn(loader.run(name_rx, obj_tx)));
    }

    /// Blocking pop of the evaluable-object queue. Returns `None` once
    /// every scope producer has finished and both queues are drained, and
    /// keeps returning `None` until the next `reset`.
    pub async fn next_obj(&self) -> Option<ObjectData> {
        let mut guard = self.obj_rx.lock().await;
        match guard.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }

    /// Number of objects waiting in the evaluable queue.
    pub async fn num_waiting(&self) -> usize {
        let guard = self.obj_rx.lock().await;
        guard.as_ref().map(|rx| rx.len()).unwrap_or(0)
    }

    /// Abort producers, drain the queues, and wake any blocked `next_obj`
    /// with end-of-scope.
    #[instrument(skip(self))]
    pub async fn flush(&self) {
        self.search_active.store(false, Ordering::SeqCst);

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().unwrap().drain(..).collect();
        for task in tasks {
            task.abort();
        }

        let mut guard = self.obj_rx.lock().await;
        if let Some(rx) = guard.as_mut() {
            while rx.try_recv().is_ok() {}
        }
        debug!("object disk flushed");
    }
}

struct Loader {
    retriever: Arc<DataRetriever>,
    cache: Arc<ObjectCache>,
    ceval: Arc<CacheEval>,
    counters: Arc<SessionCounters>,
    device_name: String,
    active: Arc<AtomicBool>,
    count: Arc<AtomicI64>,
}

impl Loader {
    async fn run(self, mut name_rx: mpsc::Receiver<ScopeEvent>, obj_tx: mpsc::Sender<ObjectData>) {
        loop {
            if !self.active.load(Ordering::SeqCst) {
                return;
            }

            // work-ahead names re-enter the pipeline ahead of fresh ones
            for uri in self.ceval.take_injected() {
                if !self.process_uri(&uri, &obj_tx).await {
                    return;
                }
            }

            match name_rx.recv().await {
                Some(ScopeEvent::Count(delta)) => {
                    self.count.fetch_add(delta, Ordering::Relaxed);
                }
                Some(ScopeEvent::Uri(uri)) => {
                    if !self.process_uri(&uri, &obj_tx).await {
                        return;
                    }
                }
                None => {
                    // scope producers finished; give late injections one
                    // final chance, then close the evaluable queue
                    for uri in self.ceval.take_injected() {
                        if !self.process_uri(&uri, &obj_tx).await {
                            return;
                        }
                    }
                    debug!("scope drained");
                    return;
                }
            }
        }
    }

    /// Fetch, build, baseline and pre-screen one object. Returns false when
    /// the pipeline should stop (consumer gone or search flushed).
    async fn process_uri(&self, uri: &str, obj_tx: &mpsc::Sender<ObjectData>) -> bool {
        match self.load_one(uri).await {
            Ok(Some(obj)) => {
                if !self.active.load(Ordering::SeqCst) {
                    return false;
                }
                obj_tx.send(obj).await.is_ok()
            }
            Ok(None) => true,
            Err(e) => {
                warn!(uri, "failed to load object: {e:#}");
                true
            }
        }
    }

    async fn load_one(&self, uri: &str) -> Result<Option<ObjectData>> {
        let fetched = match self.retriever.fetch_object(uri).await {
            Ok(f) => f,
            Err(EngineError::NotFound) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut obj = ObjectData::new(uri);
        for (name, value) in &fetched.attrs {
            obj.attrs.write(name, value.as_bytes())?;
        }
        obj.attrs.write(OBJ_DATA, &fetched.body)?;
        obj.attrs.write(OBJ_ID, uri.as_bytes())?;
        obj.attrs.write(OBJ_URI, uri.as_bytes())?;
        obj.attrs.write_if_absent(DISPLAY_NAME, uri.as_bytes())?;
        obj.attrs
            .write_if_absent(DEVICE_NAME, self.device_name.as_bytes())?;

        if let Err(e) = self.cache.add_initial(&obj).await {
            warn!(uri, "baseline record failed: {e:#}");
        }

        match self.ceval.preflight(&obj).await {
            Ok(Preflight::Drop) => {
                SessionCounters::bump(&self.counters.obj_processed);
                SessionCounters::bump(&self.counters.obj_dropped);
                Ok(None)
            }
            Ok(Preflight::Evaluate { hits }) => {
                if !hits.is_empty() {
                    self.ceval.load_cached_attrs(&mut obj, &hits).await?;
                }
                Ok(Some(obj))
            }
            Err(e) => {
                warn!(uri, "cache preflight failed: {e:#}");
                Ok(Some(obj))
            }
        }
    }
}
