//! Per-connection state and the serialized write path.
//!
//! A session is owned by exactly one reader task; the broadcaster shares it
//! read-only plus the write lock. Every frame that leaves the gateway goes
//! through [`Session::write_frame`], so two writes on one socket can never
//! interleave.

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use anyhow::{bail, Result};
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use uuid::Uuid;

use super::wire::{PushMessage, StratumNotify, StratumResp};
use crate::upstream::ErrorReply;

/// Stale jobs kept per session.
pub const MAX_STALE: usize = 10;
/// Most-recent stale entries retained when the cache is trimmed.
pub const KEEP_STALE: usize = 3;

/// Socket abstraction so plain TCP and TLS sessions share one code path.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

pub type BoxedTransport = Box<dyn Transport>;

/// Stratum dialect spoken on a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Dialect {
    #[default]
    Unset,
    EthProxy,
    NiceHash,
}

#[derive(Debug, Clone)]
pub struct JobDetails {
    pub job_id: String,
    /// Without `0x` prefix.
    pub seed_hash: String,
    /// Without `0x` prefix.
    pub header_hash: String,
    /// Height as received from the work source (hex string).
    pub height: String,
}

#[derive(Debug, Clone)]
struct StaleJob {
    seed_hash: String,
    header_hash: String,
}

/// Mutable protocol state, shared between the reader task and the
/// broadcaster.
#[derive(Default)]
pub struct MinerState {
    pub login: String,
    pub worker: String,
    pub dialect: Dialect,
    pub extranonce_subscribed: bool,
    pub job_current: Option<JobDetails>,
    stale_jobs: HashMap<String, StaleJob>,
    stale_order: Vec<String>,
}

impl MinerState {
    /// Dialect leaves `Unset` at most once and never flips afterwards.
    pub fn set_dialect(&mut self, dialect: Dialect) {
        if self.dialect == Dialect::Unset && dialect != Dialect::Unset {
            self.dialect = dialect;
        }
    }

    /// Park the active job in the stale cache before it is overwritten.
    ///
    /// The cache never holds more than `max` jobs: once full, everything but
    /// the `keep` most recent entries is evicted before the insert.
    pub fn cache_stales(&mut self, max: usize, keep: usize) {
        if self.stale_order.len() >= max {
            let cut = self.stale_order.len() - keep;
            for job_id in self.stale_order.drain(..cut) {
                self.stale_jobs.remove(&job_id);
            }
        }
        if let Some(job) = &self.job_current {
            self.stale_jobs.insert(
                job.job_id.clone(),
                StaleJob {
                    seed_hash: job.seed_hash.clone(),
                    header_hash: job.header_hash.clone(),
                },
            );
            self.stale_order.push(job.job_id.clone());
        }
    }

    /// Seed and header for a recently superseded job, if still cached.
    pub fn stale_job(&self, job_id: &str) -> Option<(String, String)> {
        self.stale_jobs
            .get(job_id)
            .map(|j| (j.seed_hash.clone(), j.header_hash.clone()))
    }

    pub fn stale_len(&self) -> usize {
        self.stale_jobs.len()
    }
}

pub struct Session {
    pub id: Uuid,
    pub ip: String,
    /// Process-unique 4-char hex prefix, issued at accept.
    pub extranonce: String,
    pub state: RwLock<MinerState>,
    timeout: Duration,
    writer: Mutex<WriteHalf<BoxedTransport>>,
    deadline: StdMutex<Instant>,
}

impl Session {
    pub fn new(
        ip: String,
        extranonce: String,
        writer: WriteHalf<BoxedTransport>,
        timeout: Duration,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            ip,
            extranonce,
            state: RwLock::new(MinerState::default()),
            timeout,
            writer: Mutex::new(writer),
            deadline: StdMutex::new(Instant::now() + timeout),
        }
    }

    /// Push the idle deadline out by the configured timeout. Called on every
    /// parsed frame and on every successful broadcast push.
    pub fn touch(&self) {
        *self.deadline.lock().unwrap() = Instant::now() + self.timeout;
    }

    pub fn deadline(&self) -> Instant {
        *self.deadline.lock().unwrap()
    }

    pub async fn dialect(&self) -> Dialect {
        self.state.read().await.dialect
    }

    /// Encode and flush one frame under the session write lock. The lock is
    /// never held across upstream calls.
    async fn write_frame<T: Serialize>(&self, frame: &T) -> Result<()> {
        let mut payload = serde_json::to_vec(frame)?;
        payload.push(b'\n');
        let mut writer = self.writer.lock().await;
        writer.write_all(&payload).await?;
        writer.flush().await?;
        Ok(())
    }

    /// JSON-RPC 2.0 success.
    pub async fn send_result(&self, id: Value, result: Value) -> Result<()> {
        self.write_frame(&StratumResp::rpc_result(id, result)).await
    }

    /// JSON-RPC 2.0 error. Fails after the write so the reader task tears
    /// the session down.
    pub async fn send_error(&self, id: Value, reply: &ErrorReply) -> Result<()> {
        self.write_frame(&StratumResp::rpc_error(id, reply)).await?;
        bail!("{}", reply.message)
    }

    /// Bare Stratum success.
    pub async fn send_stratum_result(&self, id: Value, result: Value) -> Result<()> {
        self.write_frame(&StratumResp::stratum_result(id, result))
            .await
    }

    /// Bare Stratum error; the session stays up unless the write itself
    /// fails.
    pub async fn send_stratum_error(&self, id: Value, error: Value) -> Result<()> {
        self.write_frame(&StratumResp::stratum_error(id, error))
            .await
    }

    /// Unsolicited request-shaped push (`mining.set_difficulty`,
    /// `mining.notify`, ...).
    pub async fn send_request(&self, notify: &StratumNotify) -> Result<()> {
        self.write_frame(notify).await
    }

    /// Legacy EthProxy push frame.
    pub async fn send_push(&self, result: Value) -> Result<()> {
        self.write_frame(&PushMessage {
            jsonrpc: "2.0",
            result,
            id: 0,
        })
        .await
    }

    /// Close the transport; unblocks a parked reader with EOF.
    pub async fn shutdown(&self) {
        let _ = self.writer.lock().await.shutdown().await;
    }
}
