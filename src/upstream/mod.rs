//! Interfaces to the work-dispatch and share-accounting backends.
//!
//! The gateway never validates shares or assembles templates itself; it talks
//! to a [`WorkSource`] for templates and logins and hands accepted wire
//! payloads to a [`ShareSink`]. Both must be safe for concurrent use.

use async_trait::async_trait;
use serde::Serialize;

pub mod node;

pub use node::NodeUpstream;

/// Snapshot of the upstream block template the gateway serves work from.
///
/// `header` and `seed` keep their `0x` prefix here; sessions strip it when
/// building NiceHash jobs.
#[derive(Debug, Clone, Default)]
pub struct BlockTemplate {
    pub header: String,
    pub seed: String,
    pub height: u64,
    pub difficulty_hex: String,
}

/// Code + message error carried back to miners, encoded per the session's
/// dialect by the wire layer.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorReply {
    pub code: i64,
    pub message: String,
}

impl ErrorReply {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait WorkSource: Send + Sync {
    /// Authenticate a miner; the returned value is the login RPC reply.
    async fn login(&self, login: &str, worker: &str) -> Result<bool, ErrorReply>;

    /// Current work in `eth_getWork` order: header, seed, share target,
    /// height (all hex, `0x`-prefixed).
    async fn get_work(&self) -> Result<[String; 4], ErrorReply>;

    async fn current_template(&self) -> Option<BlockTemplate>;

    /// True while the upstream is considered unhealthy; broadcasts are
    /// suppressed for a sick upstream.
    fn is_sick(&self) -> bool;
}

#[async_trait]
pub trait ShareSink: Send + Sync {
    /// Forward a share. `params` is the wire triple in submit order
    /// (nonce first); interpretation of the remaining slots belongs to the
    /// backend.
    async fn submit(
        &self,
        login: &str,
        worker: &str,
        ip: &str,
        params: [String; 3],
    ) -> Result<bool, ErrorReply>;
}
