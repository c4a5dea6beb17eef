//! End-to-end search tests against an in-process data retriever.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use siftd::engine::attr::{filter_score_attr, DISPLAY_NAME};
use siftd::engine::config::EngineConfig;
use siftd::engine::exec::{FilterCode, FilterFactory, ObjectHandle};
use siftd::engine::object::TransmitItem;
use siftd::engine::search::{SearchHandle, SearchSession};
use siftd::engine::sig::Signature;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

#[derive(Clone)]
struct ServedObject {
    uri: &'static str,
    body: &'static [u8],
    attrs: Vec<(&'static str, &'static str)>,
}

/// Minimal data retriever: any gid path returns the scope list, object
/// paths return bodies with x-attr headers.
async fn spawn_retriever(objects: Vec<ServedObject>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((mut sock, _)) = listener.accept().await else {
                break;
            };
            let objects = objects.clone();
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let mut chunk = [0u8; 1024];
                loop {
                    match sock.read(&mut chunk).await {
                        Ok(0) => return,
                        Ok(n) => {
                            buf.extend_from_slice(&chunk[..n]);
                            if buf.windows(4).any(|w| w == b"\r\n\r\n") {
                                break;
                            }
                        }
                        Err(_) => return,
                    }
                }
                let head = String::from_utf8_lossy(&buf);
                let path = head.split_whitespace().nth(1).unwrap_or("/").to_string();

                let response = match objects.iter().find(|o| path.ends_with(o.uri)) {
                    Some(obj) => {
                        let mut headers = String::new();
                        for (name, value) in &obj.attrs {
                            headers.push_str(&format!("x-attr-{name}: {value}\r\n"));
                        }
                        let mut out = format!(
                            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n{}Connection: close\r\n\r\n",
                            obj.body.len(),
                            headers
                        )
                        .into_bytes();
                        out.extend_from_slice(obj.body);
                        out
                    }
                    None if path.contains("%3A") => {
                        let mut body = format!("<objectlist count=\"{}\">", objects.len());
                        for obj in &objects {
                            body.push_str(&format!("<object src=\"{}\"/>", obj.uri));
                        }
                        body.push_str("</objectlist>");
                        format!(
                            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                            body.len(),
                            body
                        )
                        .into_bytes()
                    }
                    None => b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                        .to_vec(),
                };
                let _ = sock.write_all(&response).await;
            });
        }
    });

    addr
}

/// Factory scoring by a fixed per-eval-function table.
struct ScoreFactory {
    scores: HashMap<&'static str, i64>,
}

#[async_trait]
impl FilterFactory for ScoreFactory {
    async fn instantiate(&self, _name: &str, eval_name: &str) -> Result<Box<dyn FilterCode>> {
        match self.scores.get(eval_name) {
            Some(&score) => Ok(Box::new(FixedScore { score })),
            None => bail!("unknown eval function {eval_name}"),
        }
    }
}

struct FixedScore {
    score: i64,
}

#[async_trait]
impl FilterCode for FixedScore {
    async fn eval(&mut self, obj: &mut ObjectHandle<'_>) -> Result<i64> {
        // touch the object data so the execution has a recorded input
        let _ = obj.ref_attr(siftd::engine::attr::OBJ_DATA);
        Ok(self.score)
    }
}

async fn session_against(
    addr: SocketAddr,
    cache_dir: &std::path::Path,
    scores: HashMap<&'static str, i64>,
    spec: &str,
) -> (SearchHandle, mpsc::Receiver<TransmitItem>) {
    let config = EngineConfig {
        retriever_base: format!("http://{addr}/collection/"),
        cache_dir: cache_dir.to_path_buf(),
        device_name: "testnode".to_string(),
        ..EngineConfig::default()
    };
    let (transmit_tx, transmit_rx) = mpsc::channel(64);
    let handle = SearchSession::spawn(config, Arc::new(ScoreFactory { scores }), transmit_tx)
        .await
        .unwrap();

    let sig = handle.install_spec(spec).unwrap();
    handle.set_spec(sig).await.unwrap();
    handle.set_scope(&[0x1122334455667788]).unwrap();
    (handle, transmit_rx)
}

async fn next_item(rx: &mut mpsc::Receiver<TransmitItem>) -> TransmitItem {
    timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("timed out waiting for transmit item")
        .expect("transmit channel closed")
}

const PASS_ALL_SPEC: &str = "
FILTER pass_all
THRESHOLD 1
EVAL_FUNCTION f_pass
";

#[tokio::test]
async fn passing_object_is_emitted_then_sentinel() {
    let addr = spawn_retriever(vec![ServedObject {
        uri: "obj/a",
        body: b"hello world",
        attrs: vec![("color", "red")],
    }])
    .await;
    let dir = tempfile::tempdir().unwrap();
    let (handle, mut rx) = session_against(
        addr,
        dir.path(),
        HashMap::from([("f_pass", 100)]),
        PASS_ALL_SPEC,
    )
    .await;

    handle.start(1).await.unwrap();

    match next_item(&mut rx).await {
        TransmitItem::Object { obj, complete } => {
            assert!(complete);
            assert_eq!(obj.id_sig, Signature::hash_str("obj/a"));
            assert_eq!(obj.attrs.read("color").unwrap(), b"red");
            assert_eq!(obj.attrs.read(DISPLAY_NAME).unwrap(), b"obj/a");
            assert_eq!(
                obj.attrs.read(&filter_score_attr("pass_all")).unwrap(),
                b"100"
            );
            handle.release_obj(obj);
        }
        TransmitItem::End => panic!("expected the object before the sentinel"),
    }

    assert!(matches!(next_item(&mut rx).await, TransmitItem::End));
    assert!(handle.is_complete());

    let stats = handle.stats().await;
    assert_eq!(stats.objs_processed, 1);
    assert_eq!(stats.objs_dropped, 0);
    assert_eq!(stats.filters.len(), 1);
    assert_eq!(stats.filters[0].called, 1);

    // the same counters are visible through the control tree, and the
    // pending cap is writable at runtime
    assert_eq!(
        handle.controls().read_leaf("search/obj_processed").unwrap(),
        "1"
    );
    handle
        .controls()
        .write_leaf("search/pend_maximum", "4")
        .unwrap();
    assert_eq!(
        handle.controls().read_leaf("search/pend_maximum").unwrap(),
        "4"
    );
}

#[tokio::test]
async fn dropped_object_is_cached_and_preculled_on_rerun() {
    let addr = spawn_retriever(vec![ServedObject {
        uri: "obj/a",
        body: b"hello world",
        attrs: vec![],
    }])
    .await;
    let dir = tempfile::tempdir().unwrap();
    let (handle, mut rx) = session_against(
        addr,
        dir.path(),
        HashMap::from([("f_pass", 0)]),
        PASS_ALL_SPEC,
    )
    .await;

    // first run: the filter executes and rejects the object
    handle.start(1).await.unwrap();
    assert!(matches!(next_item(&mut rx).await, TransmitItem::End));
    let stats = handle.stats().await;
    assert_eq!(stats.objs_processed, 1);
    assert_eq!(stats.objs_dropped, 1);
    assert_eq!(stats.filters[0].called, 1);
    assert_eq!(stats.filters[0].dropped, 1);

    // second run: the pre-eval stage consults the cache and never queues
    // the object
    handle.start(2).await.unwrap();
    assert!(matches!(next_item(&mut rx).await, TransmitItem::End));
    let stats = handle.stats().await;
    assert_eq!(stats.objs_dropped, 1);
    assert_eq!(
        stats.filters[0].called, 0,
        "the filter must not execute again"
    );
}

#[tokio::test]
async fn reexecution_returns_annotated_object_and_bumps_pend() {
    let addr = spawn_retriever(vec![ServedObject {
        uri: "obj/a",
        body: b"hello world",
        attrs: vec![],
    }])
    .await;
    let dir = tempfile::tempdir().unwrap();
    let (handle, mut rx) = session_against(
        addr,
        dir.path(),
        HashMap::from([("f_pass", 100)]),
        PASS_ALL_SPEC,
    )
    .await;

    handle.start(1).await.unwrap();
    let first = next_item(&mut rx).await;
    let TransmitItem::Object { obj, .. } = first else {
        panic!("expected the object first");
    };
    handle.release_obj(obj);
    assert!(matches!(next_item(&mut rx).await, TransmitItem::End));

    let pend_before = handle.pend_objs();
    let obj = handle.reexecute("obj/a").await.unwrap();
    assert_eq!(obj.id_sig, Signature::hash_str("obj/a"));
    // force-eval resolved the whole pipeline
    assert_eq!(obj.remain_compute, 0.0);
    assert_eq!(handle.pend_objs(), pend_before + 1);
    handle.release_obj(obj);
    assert_eq!(handle.pend_objs(), pend_before);
}

#[tokio::test]
async fn missing_objects_are_dropped_not_fatal() {
    // scope names two objects; only one exists
    let objects = vec![
        ServedObject {
            uri: "obj/a",
            body: b"here",
            attrs: vec![],
        },
        ServedObject {
            uri: "obj/gone",
            body: b"",
            attrs: vec![],
        },
    ];
    // serve the scope list for both but 404 the second body
    let addr = spawn_retriever_with_missing(objects, "obj/gone").await;

    let dir = tempfile::tempdir().unwrap();
    let (handle, mut rx) = session_against(
        addr,
        dir.path(),
        HashMap::from([("f_pass", 100)]),
        PASS_ALL_SPEC,
    )
    .await;

    handle.start(1).await.unwrap();
    let TransmitItem::Object { obj, .. } = next_item(&mut rx).await else {
        panic!("expected the existing object");
    };
    assert_eq!(obj.id_sig, Signature::hash_str("obj/a"));
    handle.release_obj(obj);
    assert!(matches!(next_item(&mut rx).await, TransmitItem::End));
}

/// Like `spawn_retriever` but one URI 404s on fetch.
async fn spawn_retriever_with_missing(objects: Vec<ServedObject>, missing: &'static str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((mut sock, _)) = listener.accept().await else {
                break;
            };
            let objects = objects.clone();
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let mut chunk = [0u8; 1024];
                loop {
                    match sock.read(&mut chunk).await {
                        Ok(0) => return,
                        Ok(n) => {
                            buf.extend_from_slice(&chunk[..n]);
                            if buf.windows(4).any(|w| w == b"\r\n\r\n") {
                                break;
                            }
                        }
                        Err(_) => return,
                    }
                }
                let head = String::from_utf8_lossy(&buf);
                let path = head.split_whitespace().nth(1).unwrap_or("/").to_string();

                let response = if path.ends_with(missing) {
                    b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                        .to_vec()
                } else if let Some(obj) = objects.iter().find(|o| path.ends_with(o.uri)) {
                    let mut out = format!(
                        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                        obj.body.len()
                    )
                    .into_bytes();
                    out.extend_from_slice(obj.body);
                    out
                } else if path.contains("%3A") {
                    let mut body = format!("<objectlist count=\"{}\">", objects.len());
                    for obj in &objects {
                        body.push_str(&format!("<object src=\"{}\"/>", obj.uri));
                    }
                    body.push_str("</objectlist>");
                    format!(
                        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        body.len(),
                        body
                    )
                    .into_bytes()
                } else {
                    b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                        .to_vec()
                };
                let _ = sock.write_all(&response).await;
            });
        }
    });

    addr
}
