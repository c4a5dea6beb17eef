//! Per-connection search state machine.
//!
//! One worker task per client connection sequences control commands and
//! drives the evaluation loop: pull an object from the object disk, run the
//! filter pipeline, and either release the object or place it on the
//! transmit queue. Reexecution of a single object happens on the caller's
//! task while the worker parks on a handshake, so exactly one of the two
//! ever touches the filter table.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, error, info, instrument, warn};

use super::bypass::{update_bypass, update_grouping};
use super::cache::ObjectCache;
use super::ceval::{CacheEval, Preflight};
use super::config::EngineConfig;
use super::dctl::ControlTree;
use super::device::DeviceChars;
use super::error::EngineError;
use super::exec::{EvalResult, FilterExecutor, FilterFactory, QueryInfo};
use super::filter::FilterTable;
use super::history::{FilterHistory, SearchletConfig};
use super::object::{ObjectData, TransmitItem};
use super::odisk::ObjectDisk;
use super::retriever::DataRetriever;
use super::session_vars::SessionVariables;
use super::sig::Signature;
use super::stats::{SearchStats, SessionCounters};
use super::attr::DISPLAY_NAME;

pub const CONTROL_QUEUE_SIZE: usize = 512;

/// Force a full local evaluation on every N-th object to keep the filter
/// statistics fed while bypass is active.
const FORCE_EVAL_MASK: u32 = 0xf;

const IDLE_TICK: Duration = Duration::from_millis(10);

pub enum Command {
    Stop,
    Term,
    Start(u32),
    Spec(Signature),
    Obj(Signature),
    Blob { name: String, bytes: Vec<u8> },
    Reexecute {
        can_start: oneshot::Sender<()>,
        done: oneshot::Receiver<()>,
    },
}

enum Flow {
    Continue,
    Terminate,
}

struct SessionShared {
    config: EngineConfig,
    retriever: Arc<DataRetriever>,
    cache: Arc<ObjectCache>,
    ceval: Arc<CacheEval>,
    odisk: Arc<ObjectDisk>,
    session_vars: Arc<SessionVariables>,
    counters: Arc<SessionCounters>,
    fdata: tokio::sync::Mutex<Option<FilterTable>>,
    executor: FilterExecutor,
    qinfo: std::sync::Mutex<QueryInfo>,
    running: AtomicBool,
    complete: AtomicBool,
    pend_max: Arc<AtomicI64>,
    work_ahead: Arc<AtomicBool>,
    dctl: ControlTree,
    device: DeviceChars,
}

/// Constructor for search sessions; one per client connection.
pub struct SearchSession;

impl SearchSession {
    /// Create the session state and spawn its worker. Evaluated objects
    /// arrive on `transmit_tx`, terminated per search by
    /// [`TransmitItem::End`].
    pub async fn spawn(
        config: EngineConfig,
        factory: Arc<dyn FilterFactory>,
        transmit_tx: mpsc::Sender<TransmitItem>,
    ) -> Result<SearchHandle> {
        let retriever = Arc::new(DataRetriever::new(&config.retriever_base)?);
        let cache = Arc::new(ObjectCache::open(&config.cache_dir).await?);
        let ceval = Arc::new(CacheEval::new(cache.clone()));
        let session_vars = Arc::new(SessionVariables::new());
        let counters = Arc::new(SessionCounters::default());
        let odisk = Arc::new(ObjectDisk::new(
            retriever.clone(),
            cache.clone(),
            ceval.clone(),
            counters.clone(),
            config.device_name.clone(),
        ));
        let executor = FilterExecutor::new(cache.clone(), factory, session_vars.clone());

        let pend_max = Arc::new(AtomicI64::new(config.pend_max as i64));
        let work_ahead = Arc::new(AtomicBool::new(config.work_ahead));

        let dctl = ControlTree::new();
        dctl.register_u32("search/obj_processed", counters.obj_processed.clone(), false);
        dctl.register_u32("search/obj_dropped", counters.obj_dropped.clone(), false);
        dctl.register_u32("search/obj_pass", counters.obj_passed.clone(), false);
        dctl.register_u32("search/obj_skipped", counters.obj_skipped.clone(), false);
        dctl.register_u32("search/tx_full_stalls", counters.tx_full_stalls.clone(), false);
        dctl.register_u32("search/tx_idles", counters.tx_idles.clone(), false);
        dctl.register_i64("search/pend_objs", counters.pend_objs.clone(), false);
        dctl.register_i64("search/pend_maximum", pend_max.clone(), true);
        dctl.register_bool("search/work_ahead", work_ahead.clone(), true);

        let shared = Arc::new(SessionShared {
            config,
            retriever,
            cache,
            ceval,
            odisk,
            session_vars,
            counters,
            fdata: tokio::sync::Mutex::new(None),
            executor,
            qinfo: std::sync::Mutex::new(QueryInfo::default()),
            running: AtomicBool::new(false),
            complete: AtomicBool::new(false),
            pend_max,
            work_ahead,
            dctl,
            device: DeviceChars::probe(),
        });

        let (cmd_tx, cmd_rx) = mpsc::channel(CONTROL_QUEUE_SIZE);
        let worker = Worker {
            transmit_tx,
            cmd_rx,
            lookahead: false,
            good_names: Vec::new(),
            history: FilterHistory::load(&shared.config.cache_dir.join("filters")),
            searchlet: SearchletConfig::default(),
            shared: shared.clone(),
        };
        tokio::spawn(worker.run());

        info!("search session ready");
        Ok(SearchHandle { cmd_tx, shared })
    }
}

/// Transport-facing handle to one search session.
#[derive(Clone)]
pub struct SearchHandle {
    cmd_tx: mpsc::Sender<Command>,
    shared: Arc<SessionShared>,
}

impl SearchHandle {
    async fn send(&self, cmd: Command) -> Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| anyhow::anyhow!("search worker gone"))
    }

    pub async fn start(&self, search_id: u32) -> Result<()> {
        self.send(Command::Start(search_id)).await
    }

    pub async fn stop(&self) -> Result<()> {
        self.send(Command::Stop).await
    }

    pub async fn terminate(&self) -> Result<()> {
        self.send(Command::Term).await
    }

    pub async fn set_spec(&self, sig: Signature) -> Result<()> {
        self.send(Command::Spec(sig)).await
    }

    pub async fn set_obj(&self, sig: Signature) -> Result<()> {
        self.send(Command::Obj(sig)).await
    }

    pub async fn set_blob(&self, name: &str, bytes: Vec<u8>) -> Result<()> {
        self.send(Command::Blob {
            name: name.to_string(),
            bytes,
        })
        .await
    }

    /// Store spec text in the session's spec directory and return its
    /// signature, ready for [`set_spec`](Self::set_spec).
    pub fn install_spec(&self, text: &str) -> Result<Signature> {
        let sig = Signature::hash_bytes(text.as_bytes());
        let path = self.spec_path(&sig);
        std::fs::create_dir_all(path.parent().unwrap())?;
        std::fs::write(&path, text)
            .with_context(|| format!("writing spec to {}", path.display()))?;
        Ok(sig)
    }

    fn spec_path(&self, sig: &Signature) -> PathBuf {
        self.shared
            .config
            .cache_dir
            .join("specs")
            .join(format!("{}.spec", sig.to_filename()))
    }

    /// Declare the search scope. Only valid while no search is running.
    pub fn set_scope(&self, gids: &[u64]) -> Result<(), EngineError> {
        self.shared.odisk.clear_gids()?;
        for &gid in gids {
            self.shared.odisk.set_gid(gid)?;
        }
        Ok(())
    }

    /// Re-evaluate a single object on the caller's task with the worker
    /// quiesced. The returned object has been force-evaluated through the
    /// full pipeline; `pend_objs` is incremented exactly once and the
    /// caller owes a [`release_obj`](Self::release_obj).
    #[instrument(skip(self))]
    pub async fn reexecute(&self, uri: &str) -> Result<ObjectData> {
        let (can_start_tx, can_start_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();
        self.send(Command::Reexecute {
            can_start: can_start_tx,
            done: done_rx,
        })
        .await?;

        // wait until the worker is quiet
        can_start_rx.await.context("worker dropped handshake")?;

        let result = self.run_reexecution(uri).await;

        // wake the worker whatever happened
        let _ = done_tx.send(());
        result
    }

    async fn run_reexecution(&self, uri: &str) -> Result<ObjectData> {
        let shared = &self.shared;
        let fetched = shared
            .retriever
            .fetch_object(uri)
            .await
            .map_err(|e| anyhow::anyhow!("reexecute fetch {uri}: {e}"))?;

        let mut obj = ObjectData::new(uri);
        for (name, value) in &fetched.attrs {
            obj.attrs.write(name, value.as_bytes())?;
        }
        obj.attrs.write(super::attr::OBJ_DATA, &fetched.body)?;
        obj.attrs.write(super::attr::OBJ_ID, uri.as_bytes())?;
        obj.attrs.write(super::attr::OBJ_URI, uri.as_bytes())?;
        obj.attrs.write_if_absent(DISPLAY_NAME, uri.as_bytes())?;
        obj.attrs
            .write_if_absent(super::attr::DEVICE_NAME, shared.config.device_name.as_bytes())?;

        shared.cache.add_initial(&obj).await?;
        if let Ok(Preflight::Evaluate { hits }) = shared.ceval.preflight(&obj).await {
            if !hits.is_empty() {
                shared.ceval.load_cached_attrs(&mut obj, &hits).await?;
            }
        }

        let qinfo = *shared.qinfo.lock().unwrap();
        let mut guard = shared.fdata.lock().await;
        let table = guard
            .as_mut()
            .ok_or_else(|| EngineError::InvalidInput("no spec loaded".to_string()))?;
        shared
            .executor
            .eval(&mut obj, table, true, &qinfo)
            .await?;
        drop(guard);

        shared.counters.pend_objs.fetch_add(1, Ordering::SeqCst);
        Ok(obj)
    }

    /// Release an object the client is done with.
    pub fn release_obj(&self, obj: ObjectData) {
        let counters = &self.shared.counters;
        if counters.pend_objs.fetch_sub(1, Ordering::SeqCst) == 1 {
            SessionCounters::bump(&counters.tx_idles);
        }
        drop(obj);
    }

    pub fn session_vars(&self) -> &SessionVariables {
        &self.shared.session_vars
    }

    /// Runtime counters and tuning knobs, addressable by path.
    pub fn controls(&self) -> &ControlTree {
        &self.shared.dctl
    }

    /// Host characteristics probed at session creation.
    pub fn device_chars(&self) -> &DeviceChars {
        &self.shared.device
    }

    /// True once the current search has drained its scope and emitted the
    /// completion sentinel.
    pub fn is_complete(&self) -> bool {
        self.shared.complete.load(Ordering::SeqCst)
    }

    /// Objects currently in flight to the client.
    pub fn pend_objs(&self) -> i64 {
        self.shared.counters.pend_objs.load(Ordering::SeqCst)
    }

    /// Recompute bypass thresholds and billing groups from live statistics
    /// with a new split ratio. Safe to call mid-search.
    pub async fn update_split(&self, ratio: f64) -> Result<()> {
        let mut guard = self.shared.fdata.lock().await;
        let table = guard
            .as_mut()
            .ok_or_else(|| EngineError::InvalidInput("no spec loaded".to_string()))?;
        update_bypass(table, self.shared.config.policy.bypass, ratio);
        update_grouping(table, self.shared.config.policy.bypass, ratio);
        Ok(())
    }

    /// Read-only snapshot of the per-search and per-filter counters.
    pub async fn stats(&self) -> SearchStats {
        let counters = &self.shared.counters;
        let guard = self.shared.fdata.lock().await;

        let (filters, avg_wall, avg_exec) = match guard.as_ref() {
            Some(table) => (
                table.stats_snapshot(),
                table.fd_avg_wall,
                table.fd_avg_exec,
            ),
            None => (Vec::new(), 0.0, 0.0),
        };

        let system_load_pct = if avg_wall > 0.0 {
            ((avg_exec / avg_wall) * 100.0).min(100.0) as u32
        } else {
            0
        };

        SearchStats {
            objs_total: self.shared.odisk.count(),
            objs_processed: counters.obj_processed.load(Ordering::Relaxed),
            objs_dropped: counters.obj_dropped.load(Ordering::Relaxed),
            objs_skipped: counters.obj_skipped.load(Ordering::Relaxed),
            system_load_pct,
            avg_obj_time_ms: avg_wall * 1000.0,
            filters,
        }
    }
}

struct Worker {
    shared: Arc<SessionShared>,
    transmit_tx: mpsc::Sender<TransmitItem>,
    cmd_rx: mpsc::Receiver<Command>,
    lookahead: bool,
    good_names: Vec<String>,
    history: FilterHistory,
    searchlet: SearchletConfig,
}

impl Worker {
    fn running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    fn set_running(&self, value: bool) {
        self.shared.running.store(value, Ordering::SeqCst);
    }

    fn pend_objs(&self) -> i64 {
        self.shared.counters.pend_objs.load(Ordering::SeqCst)
    }

    fn pend_max(&self) -> i64 {
        self.shared.pend_max.load(Ordering::Relaxed)
    }

    fn work_ahead(&self) -> bool {
        self.shared.work_ahead.load(Ordering::Relaxed)
    }

    async fn run(mut self) {
        debug!("search worker started");
        loop {
            // commands always take priority over object work
            match self.cmd_rx.try_recv() {
                Ok(cmd) => {
                    if matches!(self.dispatch(cmd).await, Flow::Terminate) {
                        break;
                    }
                    continue;
                }
                Err(mpsc::error::TryRecvError::Disconnected) => break,
                Err(mpsc::error::TryRecvError::Empty) => {}
            }

            if self.running() && self.pend_objs() < self.pend_max() {
                if self.lookahead {
                    // hand the warm names back to the pre-eval stage
                    self.shared
                        .ceval
                        .inject_names(std::mem::take(&mut self.good_names));
                    self.lookahead = false;
                }
                let stop = tokio::select! {
                    biased;
                    cmd = self.cmd_rx.recv() => match cmd {
                        Some(cmd) => matches!(self.dispatch(cmd).await, Flow::Terminate),
                        None => true,
                    },
                    obj = self.shared.odisk.next_obj() => {
                        self.step(obj).await;
                        false
                    }
                };
                if stop {
                    break;
                }
            } else if self.running() && self.work_ahead() {
                let stop = tokio::select! {
                    biased;
                    cmd = self.cmd_rx.recv() => match cmd {
                        Some(cmd) => matches!(self.dispatch(cmd).await, Flow::Terminate),
                        None => true,
                    },
                    obj = self.shared.odisk.next_obj() => {
                        self.work_ahead_step(obj).await;
                        false
                    }
                };
                if stop {
                    break;
                }
            } else {
                if self.running() {
                    SessionCounters::bump(&self.shared.counters.tx_full_stalls);
                }
                match timeout(IDLE_TICK, self.cmd_rx.recv()).await {
                    Ok(Some(cmd)) => {
                        if matches!(self.dispatch(cmd).await, Flow::Terminate) {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(_) => {}
                }
            }
        }
        self.shared.odisk.flush().await;
        debug!("search worker exited");
    }

    /// Evaluate one freshly pulled object, or finish the search on
    /// end-of-scope.
    async fn step(&mut self, obj: Option<ObjectData>) {
        let counters = &self.shared.counters;

        let Some(mut obj) = obj else {
            // scope drained: emit the completion sentinel
            self.set_running(false);
            self.shared.complete.store(true, Ordering::SeqCst);
            info!(
                processed = counters.obj_processed.load(Ordering::Relaxed),
                passed = counters.obj_passed.load(Ordering::Relaxed),
                dropped = counters.obj_dropped.load(Ordering::Relaxed),
                "search complete"
            );
            if self.transmit_tx.send(TransmitItem::End).await.is_err() {
                warn!("transmit queue closed before completion sentinel");
            }
            return;
        };

        let processed = counters.obj_processed.fetch_add(1, Ordering::Relaxed) + 1;
        let force_eval = (processed & FORCE_EVAL_MASK) == FORCE_EVAL_MASK;

        let qinfo = *self.shared.qinfo.lock().unwrap();
        let started = Instant::now();

        let mut guard = self.shared.fdata.lock().await;
        let Some(table) = guard.as_mut() else {
            warn!("object arrived with no spec loaded");
            return;
        };
        let verdict = self
            .shared
            .executor
            .eval(&mut obj, table, force_eval, &qinfo)
            .await;
        let wall_ns = started.elapsed().as_nanos() as u64;
        table.record_obj_time(wall_ns, wall_ns);
        drop(guard);

        match verdict {
            Ok(EvalResult::Drop) => {
                SessionCounters::bump(&counters.obj_dropped);
            }
            Ok(result) => {
                SessionCounters::bump(&counters.obj_passed);
                counters.pend_objs.fetch_add(1, Ordering::SeqCst);
                let complete = result == EvalResult::PassComplete;
                if self
                    .transmit_tx
                    .send(TransmitItem::Object { obj, complete })
                    .await
                    .is_err()
                {
                    counters.pend_objs.fetch_sub(1, Ordering::SeqCst);
                    warn!("transmit queue closed, stopping search");
                    self.set_running(false);
                }
            }
            Err(e) => {
                error!("evaluation failed: {e:#}");
                SessionCounters::bump(&counters.obj_dropped);
            }
        }
    }

    /// At capacity: keep the pipeline warm by force-evaluating and
    /// discarding, remembering what passed for later re-fetch.
    async fn work_ahead_step(&mut self, obj: Option<ObjectData>) {
        let counters = &self.shared.counters;
        let Some(mut obj) = obj else {
            SessionCounters::bump(&counters.tx_full_stalls);
            return;
        };
        self.lookahead = true;

        let qinfo = *self.shared.qinfo.lock().unwrap();
        let mut guard = self.shared.fdata.lock().await;
        let Some(table) = guard.as_mut() else { return };
        let verdict = self
            .shared
            .executor
            .eval(&mut obj, table, true, &qinfo)
            .await;
        drop(guard);

        match verdict {
            Ok(EvalResult::Drop) => {
                SessionCounters::bump(&counters.obj_processed);
                SessionCounters::bump(&counters.obj_dropped);
            }
            Ok(_) => {
                SessionCounters::bump(&counters.obj_processed);
                if let Some(name) = obj.attrs.peek(DISPLAY_NAME) {
                    if let Ok(name) = String::from_utf8(name.to_vec()) {
                        self.good_names.push(name);
                    }
                }
            }
            Err(e) => error!("work-ahead evaluation failed: {e:#}"),
        }
    }

    async fn dispatch(&mut self, cmd: Command) -> Flow {
        match cmd {
            Command::Stop => {
                self.set_running(false);
                self.shared.odisk.flush().await;
                self.record_history().await;
                let counters = &self.shared.counters;
                info!(
                    processed = counters.obj_processed.load(Ordering::Relaxed),
                    passed = counters.obj_passed.load(Ordering::Relaxed),
                    dropped = counters.obj_dropped.load(Ordering::Relaxed),
                    "search stopped"
                );
            }

            Command::Term => {
                self.record_history().await;
                return Flow::Terminate;
            }

            Command::Start(search_id) => {
                if let Err(e) = self.handle_start(search_id).await {
                    error!("start failed: {e:#}");
                }
            }

            Command::Spec(sig) => {
                if let Err(e) = self.handle_spec(sig).await {
                    error!("spec load failed: {e:#}");
                }
            }

            Command::Obj(sig) => {
                let mut guard = self.shared.fdata.lock().await;
                match guard.as_mut() {
                    Some(table) => {
                        table.add_lib(sig);
                        self.searchlet.obj_sigs.push(sig);
                    }
                    None => warn!("object file received before spec"),
                }
            }

            Command::Blob { name, bytes } => {
                let mut guard = self.shared.fdata.lock().await;
                match guard.as_mut() {
                    Some(table) => {
                        let blob_sig = Signature::hash_bytes(&bytes);
                        let blob_len = bytes.len();
                        match table.set_blob(&name, bytes) {
                            Ok(()) => self.searchlet.blobs.push((name, blob_sig, blob_len)),
                            Err(e) => warn!("blob binding failed: {e}"),
                        }
                    }
                    None => warn!("blob received before spec"),
                }
            }

            Command::Reexecute { can_start, done } => {
                // the worker is quiet from here until the caller finishes
                let _ = can_start.send(());
                let _ = done.await;
            }
        }
        Flow::Continue
    }

    async fn handle_start(&mut self, search_id: u32) -> Result<()> {
        // settle any previous run before touching shared state
        self.set_running(false);
        self.shared.complete.store(false, Ordering::SeqCst);
        self.good_names.clear();
        self.lookahead = false;

        let shared = &self.shared;
        shared.counters.clear_search();
        shared.qinfo.lock().unwrap().query_start = chrono::Utc::now().timestamp();

        {
            let mut guard = shared.fdata.lock().await;
            let table = guard
                .as_mut()
                .ok_or_else(|| EngineError::InvalidInput("start without a spec".to_string()))?;
            table.clear_stats();
            table.search_started = Some(Instant::now());
            update_bypass(table, shared.config.policy.bypass, shared.config.policy.split_ratio);
            update_grouping(table, shared.config.policy.bypass, shared.config.policy.split_ratio);
            shared.ceval.init_search(table.ceval_snapshot());
        }

        // remember the installed searchlet so an idle refresh can rebuild it
        if let Err(e) = self
            .searchlet
            .save(&shared.config.cache_dir.join("filters"))
        {
            warn!("searchlet save failed: {e:#}");
        }

        shared.odisk.reset(search_id).await;
        shared.counters.searches.fetch_add(1, Ordering::Relaxed);
        self.set_running(true);
        info!(search_id, "search started");
        Ok(())
    }

    /// Fold the finished search's filter totals into the persistent run
    /// history.
    async fn record_history(&mut self) {
        let guard = self.shared.fdata.lock().await;
        let Some(table) = guard.as_ref() else { return };

        let processed = self
            .shared
            .counters
            .obj_processed
            .load(Ordering::Relaxed) as u64;
        if processed == 0 {
            return;
        }
        self.history
            .record_search(table, processed, chrono::Utc::now().timestamp());
        if let Err(e) = self.history.save() {
            warn!("history save failed: {e:#}");
        }
    }

    async fn handle_spec(&mut self, sig: Signature) -> Result<()> {
        // a new spec terminates whatever search was running
        if self.running() {
            self.set_running(false);
            self.shared.odisk.flush().await;
        }

        let path = self
            .shared
            .config
            .cache_dir
            .join("specs")
            .join(format!("{}.spec", sig.to_filename()));
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading spec {}", path.display()))?;

        let table = FilterTable::from_spec(&text, sig)?;
        info!(filters = table.filters.len(), spec = %sig, "spec loaded");
        *self.shared.fdata.lock().await = Some(table);
        self.searchlet = SearchletConfig {
            spec_sig: sig,
            ..SearchletConfig::default()
        };
        Ok(())
    }
}
