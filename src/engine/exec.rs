//! Filter execution against a single object.
//!
//! The executor walks the current permutation, consulting the cache before
//! each filter and short-circuiting the pipeline on a below-threshold
//! score. Attribute traffic during a real execution is observed through the
//! attribute-store listener and recorded into the cache's transient tables,
//! so the execution can be replayed from the cache next time the same
//! object shows up in the same context.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::Result;
use async_trait::async_trait;
use rand::Rng;
use tracing::{debug, instrument, warn};

use super::attr::{filter_error_attr, filter_score_attr, filter_time_attr, AttrListener, FILTER_TOTAL_TIME};
use super::bypass::BYPASS_MAX;
use super::cache::ObjectCache;
use super::filter::FilterTable;
use super::object::ObjectData;
use super::session_vars::SessionVariables;
use super::sig::Signature;

/// Outcome of one pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalResult {
    /// Some filter rejected the object.
    Drop,
    /// A bypass draw stopped the pipeline; the client finishes the rest.
    PassPartial,
    /// Every filter passed or hit the cache above threshold.
    PassComplete,
}

/// Epochs used to classify cache hits for the stats report.
#[derive(Debug, Clone, Copy)]
pub struct QueryInfo {
    pub session_start: i64,
    pub query_start: i64,
}

impl Default for QueryInfo {
    fn default() -> Self {
        let now = chrono::Utc::now().timestamp();
        QueryInfo {
            session_start: now,
            query_start: now,
        }
    }
}

/// The filter's view of the object it is evaluating.
pub struct ObjectHandle<'a> {
    obj: &'a mut ObjectData,
    session_vars: &'a SessionVariables,
}

impl<'a> ObjectHandle<'a> {
    pub fn id_sig(&self) -> Signature {
        self.obj.id_sig
    }

    pub fn read_attr(&self, name: &str) -> Option<Vec<u8>> {
        self.obj.attrs.read(name)
    }

    pub fn ref_attr(&self, name: &str) -> Option<&[u8]> {
        self.obj.attrs.ref_attr(name)
    }

    pub fn write_attr(&mut self, name: &str, value: &[u8]) -> Result<()> {
        self.obj.attrs.write(name, value).map_err(Into::into)
    }

    pub fn omit_attr(&mut self, name: &str) -> Result<()> {
        self.obj.attrs.omit(name).map_err(Into::into)
    }

    pub fn session_var(&self, name: &str) -> f64 {
        self.session_vars.value(name)
    }

    pub fn add_session_var(&self, name: &str, delta: f64) {
        self.session_vars.add(name, delta);
    }
}

/// One instantiated filter. The engine treats filter code as an opaque
/// invocable unit; the factory below decides what actually runs.
#[async_trait]
pub trait FilterCode: Send {
    /// Called lazily, once, before the first evaluation.
    async fn init(&mut self, args: &[String], blob: &[u8]) -> Result<()> {
        let _ = (args, blob);
        Ok(())
    }

    /// Score the object. Scores at or above the filter threshold pass.
    async fn eval(&mut self, obj: &mut ObjectHandle<'_>) -> Result<i64>;
}

/// Resolves a filter descriptor to runnable code.
#[async_trait]
pub trait FilterFactory: Send + Sync {
    async fn instantiate(&self, name: &str, eval_name: &str) -> Result<Box<dyn FilterCode>>;
}

/// Listener capturing the attribute traffic of the running filter.
#[derive(Default)]
struct ExecRecorder {
    state: Mutex<RecorderState>,
}

#[derive(Default)]
struct RecorderState {
    iattrs: Vec<(String, Signature)>,
    oattrs: Vec<(String, Signature, i64)>,
}

impl ExecRecorder {
    fn take(&self) -> RecorderState {
        std::mem::take(&mut *self.state.lock().unwrap())
    }
}

impl AttrListener for ExecRecorder {
    fn on_read(&self, name: &str, _value: &[u8], sig: &Signature) {
        let mut state = self.state.lock().unwrap();
        state.iattrs.retain(|(n, _)| n != name);
        state.iattrs.push((name.to_string(), *sig));
    }

    fn on_write(&self, name: &str, value: &[u8], sig: &Signature) {
        let mut state = self.state.lock().unwrap();
        state.oattrs.retain(|(n, _, _)| n != name);
        state.oattrs.push((name.to_string(), *sig, value.len() as i64));
    }
}

pub struct FilterExecutor {
    cache: Arc<ObjectCache>,
    factory: Arc<dyn FilterFactory>,
    session_vars: Arc<SessionVariables>,
}

impl FilterExecutor {
    pub fn new(
        cache: Arc<ObjectCache>,
        factory: Arc<dyn FilterFactory>,
        session_vars: Arc<SessionVariables>,
    ) -> Self {
        FilterExecutor {
            cache,
            factory,
            session_vars,
        }
    }

    /// Run the pipeline over one object.
    #[instrument(skip_all, fields(obj = %obj.id_sig, force_eval), level = "debug")]
    pub async fn eval(
        &self,
        obj: &mut ObjectData,
        table: &mut FilterTable,
        force_eval: bool,
        qinfo: &QueryInfo,
    ) -> Result<EvalResult> {
        let _ctx = self.cache.lock_context().await;
        self.cache.reset_current(&obj.id_sig).await?;
        self.cache.add_initial(obj).await?;

        let perm = table.permutation.clone();
        let n = perm.len().max(1);
        let mut resolved = 0usize;
        let mut total_ns: u64 = 0;
        let mut outcome = EvalResult::PassComplete;

        for &fidx in &perm {
            if !force_eval {
                let draw: i32 = rand::thread_rng().gen_range(0..=BYPASS_MAX);
                if draw > table.filters[fidx].bp_thresh {
                    outcome = EvalResult::PassPartial;
                    break;
                }
            }

            let fsig = table.filters[fidx].sig;
            let threshold = table.filters[fidx].threshold;

            if let Some(hit) = self.cache.lookup(&obj.id_sig, &fsig).await? {
                let f = &mut table.filters[fidx];
                if hit.create_time < qinfo.session_start {
                    f.stats.hits_inter_session += 1;
                } else if hit.create_time < qinfo.query_start {
                    f.stats.hits_inter_query += 1;
                } else {
                    f.stats.hits_intra_query += 1;
                }

                if hit.score < threshold {
                    f.stats.cache_drop += 1;
                    outcome = EvalResult::Drop;
                    break;
                }
                f.stats.cache_pass += 1;
                self.cache.combine(hit.entry).await?;
                resolved += 1;
                continue;
            }

            let (score, elapsed_ns, errored) = self.execute_one(obj, table, fidx, &fsig).await?;

            let f = &mut table.filters[fidx];
            f.stats.called += 1;
            f.stats.time_ns += elapsed_ns;
            total_ns += elapsed_ns;

            if errored {
                f.stats.errored += 1;
                resolved += 1;
                continue;
            }

            f.stats.compute += 1;
            if score < threshold {
                f.stats.dropped += 1;
                outcome = EvalResult::Drop;
                break;
            }
            f.stats.passed += 1;
            resolved += 1;
        }

        obj.attrs
            .write(FILTER_TOTAL_TIME, &total_ns.to_le_bytes())
            .ok();
        obj.remain_compute = 1.0 - resolved as f64 / n as f64;

        Ok(outcome)
    }

    /// Execute a single filter for real: lazy init, recorder installation,
    /// timing, cache recording, annotations. Returns (score, elapsed_ns,
    /// errored); a filter failure is not a search failure.
    async fn execute_one(
        &self,
        obj: &mut ObjectData,
        table: &mut FilterTable,
        fidx: usize,
        fsig: &Signature,
    ) -> Result<(i64, u64, bool)> {
        self.cache.exec_begin().await?;

        {
            let f = &mut table.filters[fidx];
            if f.code.is_none() {
                f.code = Some(self.factory.instantiate(&f.name, &f.eval_name).await?);
            }
            if !f.initialized {
                let args = f.args.clone();
                let blob = f.blob.clone();
                f.code.as_mut().unwrap().init(&args, &blob).await?;
                f.initialized = true;
            }
        }

        let recorder = Arc::new(ExecRecorder::default());
        obj.attrs.set_listener(recorder.clone());

        let started = Instant::now();
        let eval_result = {
            let mut handle = ObjectHandle {
                obj,
                session_vars: self.session_vars.as_ref(),
            };
            let f = &mut table.filters[fidx];
            f.code.as_mut().unwrap().eval(&mut handle).await
        };
        let elapsed = started.elapsed();
        let elapsed_ns = elapsed.as_nanos() as u64;

        obj.attrs.clear_listener();
        let recorded = recorder.take();

        let name = table.filters[fidx].name.clone();
        let score = match eval_result {
            Ok(score) => score,
            Err(e) => {
                warn!(filter = %name, "filter failed: {e:#}");
                obj.attrs
                    .write(&filter_error_attr(&name), e.to_string().as_bytes())
                    .ok();
                return Ok((0, elapsed_ns, true));
            }
        };

        let added_bytes: i64 = recorded.oattrs.iter().map(|(_, _, len)| len).sum();
        table.filters[fidx].stats.added_bytes += added_bytes.max(0) as u64;

        for (attr_name, sig) in &recorded.iattrs {
            self.cache.on_iattr(attr_name, sig).await?;
        }
        for (attr_name, sig, len) in &recorded.oattrs {
            self.cache.on_oattr(attr_name, sig, *len).await?;
        }
        if let Err(e) = self
            .cache
            .exec_end(obj, fsig, score, elapsed.as_millis() as i64)
            .await
        {
            warn!(filter = %name, "cache record failed: {e:#}");
        }

        // annotations are written after exec_end so they are not captured
        // as filter outputs
        debug!(filter = %name, score, elapsed_ns, "filter executed");
        obj.attrs
            .write(&filter_score_attr(&name), score.to_string().as_bytes())
            .ok();
        obj.attrs
            .write(&filter_time_attr(&name), &elapsed_ns.to_le_bytes())
            .ok();

        Ok((score, elapsed_ns, false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::attr::{filter_error_attr, filter_score_attr, OBJ_DATA};
    use crate::engine::filter::FilterTable;
    use crate::engine::object::ObjectData;
    use anyhow::bail;

    struct TestFactory;

    #[async_trait]
    impl FilterFactory for TestFactory {
        async fn instantiate(&self, _name: &str, eval_name: &str) -> Result<Box<dyn FilterCode>> {
            Ok(match eval_name {
                "f_hundred" => Box::new(Fixed(100)),
                "f_zero" => Box::new(Fixed(0)),
                "f_fail" => Box::new(Failing),
                "f_tally" => Box::new(Tally),
                other => bail!("unknown eval function {other}"),
            })
        }
    }

    struct Fixed(i64);

    #[async_trait]
    impl FilterCode for Fixed {
        async fn eval(&mut self, obj: &mut ObjectHandle<'_>) -> Result<i64> {
            let _ = obj.ref_attr(OBJ_DATA);
            Ok(self.0)
        }
    }

    struct Failing;

    #[async_trait]
    impl FilterCode for Failing {
        async fn eval(&mut self, _obj: &mut ObjectHandle<'_>) -> Result<i64> {
            bail!("synthetic filter crash")
        }
    }

    /// Counts objects seen in a session variable and tags each object.
    struct Tally;

    #[async_trait]
    impl FilterCode for Tally {
        async fn eval(&mut self, obj: &mut ObjectHandle<'_>) -> Result<i64> {
            obj.add_session_var("tally", 1.0);
            obj.write_attr("tagged", b"yes")?;
            Ok(100)
        }
    }

    fn executor() -> (FilterExecutor, Arc<SessionVariables>) {
        let vars = Arc::new(SessionVariables::new());
        let executor = FilterExecutor::new(
            Arc::new(ObjectCache::disabled()),
            Arc::new(TestFactory),
            vars.clone(),
        );
        (executor, vars)
    }

    fn table(spec: &str) -> FilterTable {
        FilterTable::from_spec(spec, Signature::hash_str("spec")).unwrap()
    }

    fn object() -> ObjectData {
        let mut obj = ObjectData::new("obj/test");
        obj.attrs.write(OBJ_DATA, b"payload").unwrap();
        obj
    }

    #[tokio::test]
    async fn full_pass_annotates_and_counts() {
        let (executor, _) = executor();
        let mut table = table(
            "FILTER first\nTHRESHOLD 1\nEVAL_FUNCTION f_hundred\n\n\
             FILTER second\nTHRESHOLD 50\nEVAL_FUNCTION f_hundred\n",
        );
        let mut obj = object();

        let result = executor
            .eval(&mut obj, &mut table, true, &QueryInfo::default())
            .await
            .unwrap();

        assert_eq!(result, EvalResult::PassComplete);
        assert_eq!(obj.remain_compute, 0.0);
        assert_eq!(obj.attrs.read(&filter_score_attr("first")).unwrap(), b"100");
        assert_eq!(obj.attrs.read(&filter_score_attr("second")).unwrap(), b"100");
        for f in &table.filters {
            assert_eq!(f.stats.called, 1);
            assert_eq!(f.stats.passed, 1);
            assert_eq!(f.stats.dropped, 0);
        }
    }

    #[tokio::test]
    async fn drop_short_circuits_the_pipeline() {
        let (executor, _) = executor();
        let mut table = table(
            "FILTER reject\nTHRESHOLD 1\nEVAL_FUNCTION f_zero\n\n\
             FILTER never\nTHRESHOLD 1\nEVAL_FUNCTION f_hundred\n",
        );
        let mut obj = object();

        let result = executor
            .eval(&mut obj, &mut table, true, &QueryInfo::default())
            .await
            .unwrap();

        assert_eq!(result, EvalResult::Drop);
        assert_eq!(table.filters[0].stats.dropped, 1);
        assert_eq!(table.filters[1].stats.called, 0, "pipeline must stop at the drop");
        assert!(obj.attrs.read(&filter_score_attr("never")).is_none());
    }

    #[tokio::test]
    async fn bypassed_filter_yields_partial_pass() {
        let (executor, _) = executor();
        let mut table = table("FILTER only\nTHRESHOLD 1\nEVAL_FUNCTION f_hundred\n");
        table.filters[0].bp_thresh = -1;
        let mut obj = object();

        let result = executor
            .eval(&mut obj, &mut table, false, &QueryInfo::default())
            .await
            .unwrap();
        assert_eq!(result, EvalResult::PassPartial);
        assert_eq!(table.filters[0].stats.called, 0);
        assert!(obj.remain_compute > 0.0);

        // force_eval ignores the threshold
        let result = executor
            .eval(&mut obj, &mut table, true, &QueryInfo::default())
            .await
            .unwrap();
        assert_eq!(result, EvalResult::PassComplete);
        assert_eq!(table.filters[0].stats.called, 1);
    }

    #[tokio::test]
    async fn filter_failure_is_not_a_search_failure() {
        let (executor, _) = executor();
        let mut table = table(
            "FILTER flaky\nTHRESHOLD 1\nEVAL_FUNCTION f_fail\n\n\
             FILTER after\nTHRESHOLD 1\nEVAL_FUNCTION f_hundred\n",
        );
        let mut obj = object();

        let result = executor
            .eval(&mut obj, &mut table, true, &QueryInfo::default())
            .await
            .unwrap();

        assert_eq!(result, EvalResult::PassComplete);
        assert_eq!(table.filters[0].stats.errored, 1);
        assert_eq!(table.filters[1].stats.passed, 1);
        let diag = obj.attrs.read(&filter_error_attr("flaky")).unwrap();
        assert!(String::from_utf8_lossy(&diag).contains("synthetic filter crash"));
    }

    #[tokio::test]
    async fn session_variables_accumulate_across_objects() {
        let (executor, vars) = executor();
        let mut table = table("FILTER tally\nTHRESHOLD 1\nEVAL_FUNCTION f_tally\n");

        for _ in 0..3 {
            let mut obj = object();
            executor
                .eval(&mut obj, &mut table, true, &QueryInfo::default())
                .await
                .unwrap();
            assert_eq!(obj.attrs.read("tagged").unwrap(), b"yes");
        }
        assert_eq!(vars.value("tally"), 3.0);
    }
}
