//! Search driver for siftd.
//!
//! Runs one search against a data retriever with a couple of built-in
//! filters, printing passing objects and the final statistics. A real
//! deployment replaces this driver with the client transport; the engine
//! underneath is the same.
//!
//! Usage: siftd <spec-file> <gid> [<gid>...]
//! Environment: SIFTD_RETRIEVER_BASE, SIFTD_CACHE_DIR

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use siftd::engine::attr::{DISPLAY_NAME, OBJ_DATA};
use siftd::engine::config::EngineConfig;
use siftd::engine::exec::{FilterCode, FilterFactory, ObjectHandle};
use siftd::engine::object::TransmitItem;
use siftd::engine::search::SearchSession;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, Level};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.len() < 2 {
        bail!("usage: siftd <spec-file> <gid> [<gid>...]");
    }
    let spec_text = std::fs::read_to_string(&args[0])
        .with_context(|| format!("reading spec {}", args[0]))?;
    let gids: Vec<u64> = args[1..]
        .iter()
        .map(|s| {
            u64::from_str_radix(s.trim_start_matches("0x"), 16)
                .with_context(|| format!("bad gid {s}"))
        })
        .collect::<Result<_>>()?;

    let config = EngineConfig::from_env();
    info!(
        retriever = %config.retriever_base,
        cache = %config.cache_dir.display(),
        "starting search driver"
    );

    let (transmit_tx, mut transmit_rx) = mpsc::channel(64);
    let handle = SearchSession::spawn(config, Arc::new(BuiltinFactory), transmit_tx).await?;

    let spec_sig = handle.install_spec(&spec_text)?;
    handle.set_spec(spec_sig).await?;
    handle.set_scope(&gids)?;
    handle.start(1).await?;

    let mut passed = 0u32;
    while let Some(item) = transmit_rx.recv().await {
        match item {
            TransmitItem::Object { obj, complete } => {
                passed += 1;
                let name = obj
                    .attrs
                    .read(DISPLAY_NAME)
                    .map(|v| String::from_utf8_lossy(&v).into_owned())
                    .unwrap_or_else(|| obj.id_sig.to_hex());
                println!("{name}{}", if complete { "" } else { " (partial)" });
                handle.release_obj(obj);
            }
            TransmitItem::End => break,
        }
    }

    let stats = handle.stats().await;
    info!(
        total = stats.objs_total,
        processed = stats.objs_processed,
        dropped = stats.objs_dropped,
        passed,
        "search finished"
    );
    println!("{}", serde_json::to_string_pretty(&stats)?);

    handle.terminate().await?;
    Ok(())
}

/// Filters available without client-supplied code: enough to exercise a
/// search end to end.
struct BuiltinFactory;

#[async_trait]
impl FilterFactory for BuiltinFactory {
    async fn instantiate(&self, name: &str, eval_name: &str) -> Result<Box<dyn FilterCode>> {
        match eval_name {
            "f_eval_pass_all" => Ok(Box::new(PassAll)),
            "f_eval_min_size" => Ok(Box::new(MinSize { min: 0 })),
            other => bail!("filter {name}: unknown eval function {other}"),
        }
    }
}

/// Scores every object 100.
struct PassAll;

#[async_trait]
impl FilterCode for PassAll {
    async fn eval(&mut self, _obj: &mut ObjectHandle<'_>) -> Result<i64> {
        Ok(100)
    }
}

/// Scores 100 when the object body is at least ARG bytes, else 0.
struct MinSize {
    min: usize,
}

#[async_trait]
impl FilterCode for MinSize {
    async fn init(&mut self, args: &[String], _blob: &[u8]) -> Result<()> {
        if let Some(arg) = args.first() {
            self.min = arg.parse().context("min-size filter: bad ARG")?;
        }
        Ok(())
    }

    async fn eval(&mut self, obj: &mut ObjectHandle<'_>) -> Result<i64> {
        let len = obj.ref_attr(OBJ_DATA).map(|v| v.len()).unwrap_or(0);
        Ok(if len >= self.min { 100 } else { 0 })
    }
}
