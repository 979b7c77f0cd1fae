//! JSON-RPC client for an Ethereum-family node, backing both the work source
//! and the share sink.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{header, Method, Request, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde_json::{json, Value};
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info, warn};

use super::{BlockTemplate, ErrorReply, ShareSink, WorkSource};
use crate::config::Config;
use crate::util;

pub struct NodeUpstream {
    name: String,
    url: Uri,
    diff_hex: String,
    health_check: bool,
    max_fails: u64,
    template: RwLock<Option<BlockTemplate>>,
    failures: AtomicU64,
    sick: AtomicBool,
    notify: watch::Sender<u64>,
}

impl NodeUpstream {
    pub fn new(config: &Config) -> Result<Arc<Self>> {
        let upstream = config
            .upstream
            .first()
            .context("no upstream configured")?;
        let url: Uri = upstream
            .url
            .parse()
            .with_context(|| format!("bad upstream url {:?}", upstream.url))?;
        let (notify, _) = watch::channel(0u64);
        Ok(Arc::new(Self {
            name: upstream.name.clone(),
            url,
            diff_hex: util::target_hex(config.proxy.difficulty),
            health_check: config.proxy.health_check,
            max_fails: config.proxy.max_fails.max(1) as u64,
            template: RwLock::new(None),
            failures: AtomicU64::new(0),
            sick: AtomicBool::new(false),
            notify,
        }))
    }

    /// Receiver ticked with the new height whenever the template header moves.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.notify.subscribe()
    }

    async fn rpc(&self, method: &str, params: Value) -> Result<Value> {
        let payload = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 0,
        });
        let client: Client<HttpConnector, Full<Bytes>> =
            Client::builder(TokioExecutor::new()).build(HttpConnector::new());
        let request = Request::builder()
            .method(Method::POST)
            .uri(self.url.clone())
            .header(header::CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(payload.to_string())))?;
        let response = client.request(request).await?;
        let body = response.into_body().collect().await?.to_bytes();
        let reply: Value = serde_json::from_slice(&body)?;
        if let Some(err) = reply.get("error").filter(|e| !e.is_null()) {
            bail!("{} returned error: {}", method, err);
        }
        reply
            .get("result")
            .cloned()
            .ok_or_else(|| anyhow!("{} reply has no result", method))
    }

    /// Fetch fresh work; returns true when the header changed and the cached
    /// template was replaced.
    pub async fn refresh(&self) -> Result<bool> {
        let result = self.rpc("eth_getWork", json!([])).await?;
        let work = result.as_array().context("eth_getWork reply is not an array")?;
        if work.len() < 2 {
            bail!("eth_getWork reply too short");
        }
        let header = work[0].as_str().unwrap_or_default().to_string();
        let seed = work[1].as_str().unwrap_or_default().to_string();
        if header.is_empty() {
            bail!("empty header in eth_getWork reply");
        }
        let height = work
            .get(3)
            .and_then(|v| v.as_str())
            .and_then(|s| u64::from_str_radix(util::strip_0x(s), 16).ok())
            .unwrap_or(0);

        let changed = {
            let current = self.template.read().await;
            current.as_ref().map(|t| t.header != header).unwrap_or(true)
        };
        if changed {
            let difficulty_hex = work
                .get(2)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            *self.template.write().await = Some(BlockTemplate {
                header,
                seed,
                height,
                difficulty_hex,
            });
            let _ = self.notify.send(height);
        }
        Ok(changed)
    }

    pub async fn refresh_loop(self: Arc<Self>, every: Duration) {
        let mut tick = tokio::time::interval(every);
        loop {
            tick.tick().await;
            match self.refresh().await {
                Ok(true) => debug!("new block template from {}", self.name),
                Ok(false) => {}
                Err(e) => {
                    let failures = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
                    warn!("upstream {} refresh failed ({} in a row): {:#}", self.name, failures, e);
                    if self.health_check
                        && failures >= self.max_fails
                        && !self.sick.swap(true, Ordering::Relaxed)
                    {
                        error!("upstream {} marked sick after {} failures", self.name, failures);
                    }
                    continue;
                }
            }
            self.failures.store(0, Ordering::Relaxed);
            self.sick.store(false, Ordering::Relaxed);
        }
    }
}

fn valid_hex_address(s: &str) -> bool {
    s.len() == 42 && s.starts_with("0x") && s[2..].bytes().all(|b| b.is_ascii_hexdigit())
}

#[async_trait]
impl WorkSource for NodeUpstream {
    async fn login(&self, login: &str, worker: &str) -> Result<bool, ErrorReply> {
        if !valid_hex_address(login) {
            return Err(ErrorReply::new(-1, "Invalid login"));
        }
        debug!("login accepted for {} (worker {:?})", login, worker);
        Ok(true)
    }

    async fn get_work(&self) -> Result<[String; 4], ErrorReply> {
        if self.template.read().await.is_none() {
            let _ = self.refresh().await;
        }
        let guard = self.template.read().await;
        let template = guard
            .as_ref()
            .ok_or_else(|| ErrorReply::new(0, "Work not ready"))?;
        Ok([
            template.header.clone(),
            template.seed.clone(),
            self.diff_hex.clone(),
            util::to_hex(template.height),
        ])
    }

    async fn current_template(&self) -> Option<BlockTemplate> {
        self.template.read().await.clone()
    }

    fn is_sick(&self) -> bool {
        self.sick.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ShareSink for NodeUpstream {
    async fn submit(
        &self,
        login: &str,
        worker: &str,
        ip: &str,
        params: [String; 3],
    ) -> Result<bool, ErrorReply> {
        let wire: Vec<String> = params.iter().map(|p| util::hex_0x(p)).collect();
        match self.rpc("eth_submitWork", json!(wire)).await {
            Ok(Value::Bool(true)) => {
                info!("share accepted from {}.{}@{}", login, worker, ip);
                Ok(true)
            }
            Ok(_) => {
                warn!("share rejected from {}.{}@{}", login, worker, ip);
                Err(ErrorReply::new(23, "Invalid share"))
            }
            Err(e) => {
                error!("share submit to {} failed: {:#}", self.name, e);
                Err(ErrorReply::new(-1, "Upstream error"))
            }
        }
    }
}
