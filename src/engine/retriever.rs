//! HTTP client for the data-retriever service.
//!
//! The retriever owns the mapping from group ids to object lists. Scope
//! lists arrive as a streamed XML document parsed incrementally; the parser
//! pushes into a bounded channel, so a full downstream queue pauses the TCP
//! read instead of buffering the whole list. Objects are plain GETs whose
//! `x-attr-*` response headers carry initial attributes.

use std::time::Duration;

use anyhow::{Context, Result};
use futures::TryStreamExt;
use quick_xml::events::Event;
use reqwest::{Client, Url};
use tokio::sync::mpsc;
use tokio_retry::{strategy::ExponentialBackoff, Retry};
use tokio_util::io::StreamReader;
use tracing::{debug, instrument, warn};

use super::error::EngineError;

const USER_AGENT: &str = "siftd";
const ATTR_HEADER_PREFIX: &str = "x-attr-";

/// One message from a scope-list producer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeEvent {
    /// An object URI, exactly as it appeared in the `src` attribute.
    Uri(String),
    /// A scope-size adjustment (`count=` on the list, `adjust=` mid-stream).
    Count(i64),
}

pub struct FetchedObject {
    pub body: Vec<u8>,
    /// Attributes recovered from `x-attr-<name>` response headers.
    pub attrs: Vec<(String, String)>,
}

pub struct DataRetriever {
    base: Url,
    scopelist_client: Client,
    object_client: Client,
}

impl DataRetriever {
    pub fn new(base_uri: &str) -> Result<Self> {
        let base = Url::parse(base_uri).context("invalid retriever base URI")?;

        // one connection for the scope list, a wider pool for object bodies
        let scopelist_client = Client::builder()
            .user_agent(USER_AGENT)
            .pool_max_idle_per_host(1)
            .build()?;
        let object_client = Client::builder()
            .user_agent(USER_AGENT)
            .pool_max_idle_per_host(64)
            .build()?;

        Ok(DataRetriever {
            base,
            scopelist_client,
            object_client,
        })
    }

    /// Gid rendered for the scope-list URL: uppercase hex byte pairs joined
    /// by an escaped colon.
    pub fn gid_path(gid: u64) -> String {
        let bytes = gid.to_be_bytes();
        let mut out = String::with_capacity(bytes.len() * 5);
        for (i, b) in bytes.iter().enumerate() {
            if i > 0 {
                out.push_str("%3A");
            }
            out.push_str(&format!("{b:02X}"));
        }
        out
    }

    /// Stream the scope list for one gid into `tx`. Returns when the
    /// document ends or the consumer goes away; the bounded channel's
    /// `send` is the backpressure point.
    #[instrument(skip(self, tx))]
    pub async fn fetch_scopelist(&self, gid: u64, tx: mpsc::Sender<ScopeEvent>) -> Result<()> {
        let url = self
            .base
            .join(&Self::gid_path(gid))
            .context("building scope-list URL")?;
        debug!("fetching scope list {url}");

        let response = self
            .scopelist_client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| EngineError::Transient(e.to_string()))?;
        if !response.status().is_success() {
            return Err(EngineError::Transient(format!(
                "scope list fetch: {} ({url})",
                response.status()
            ))
            .into());
        }

        let stream = Box::pin(
            response
                .bytes_stream()
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)),
        );
        let mut reader = quick_xml::Reader::from_reader(StreamReader::new(stream));

        let mut buf = Vec::new();
        loop {
            let event = reader
                .read_event_into_async(&mut buf)
                .await
                .context("malformed scope list")?;
            let msg = match &event {
                Event::Start(e) | Event::Empty(e) => match e.name().as_ref() {
                    b"object" => attr_value(e, "src")?.map(ScopeEvent::Uri),
                    b"count" => parse_count(attr_value(e, "adjust")?)?,
                    b"objectlist" => parse_count(attr_value(e, "count")?)?,
                    _ => None,
                },
                Event::Eof => break,
                _ => None,
            };
            if let Some(msg) = msg {
                if tx.send(msg).await.is_err() {
                    // consumer gone, the search was flushed
                    return Ok(());
                }
            }
            buf.clear();
        }
        Ok(())
    }

    /// Fetch one object, resolving `uri` against the collection base.
    /// Server errors are retried with backoff; other non-2xx statuses drop
    /// the object.
    #[instrument(skip(self))]
    pub async fn fetch_object(&self, uri: &str) -> Result<FetchedObject, EngineError> {
        let url = self
            .base
            .join(uri)
            .map_err(|e| EngineError::InvalidInput(format!("object URI {uri}: {e}")))?;

        let strategy = ExponentialBackoff::from_millis(100)
            .max_delay(Duration::from_secs(5))
            .take(3);

        let response = Retry::spawn(strategy, || async {
            let response = self
                .object_client
                .get(url.clone())
                .send()
                .await
                .map_err(|e| EngineError::Transient(e.to_string()))?;
            if response.status().is_server_error() {
                return Err(EngineError::Transient(format!(
                    "object fetch: {}",
                    response.status()
                )));
            }
            Ok(response)
        })
        .await?;

        if !response.status().is_success() {
            warn!("data fetch: {} ({uri})", response.status());
            return Err(EngineError::NotFound);
        }

        let mut attrs = Vec::new();
        for (key, value) in response.headers() {
            if let Some(name) = key.as_str().strip_prefix(ATTR_HEADER_PREFIX) {
                if let Ok(value) = value.to_str() {
                    attrs.push((name.to_string(), value.to_string()));
                }
            }
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| EngineError::Transient(e.to_string()))?
            .to_vec();

        Ok(FetchedObject { body, attrs })
    }
}

fn attr_value(e: &quick_xml::events::BytesStart<'_>, name: &str) -> Result<Option<String>> {
    Ok(match e.try_get_attribute(name)? {
        Some(a) => Some(a.unescape_value()?.into_owned()),
        None => None,
    })
}

fn parse_count(value: Option<String>) -> Result<Option<ScopeEvent>> {
    Ok(match value {
        Some(v) => Some(ScopeEvent::Count(
            v.parse::<i64>().context("bad count in scope list")?,
        )),
        None => None,
    })
}
