pub mod server;
pub mod session;
pub mod wire;

mod handler;

pub use server::StratumServer;
pub use session::{Dialect, MinerState, Session, KEEP_STALE, MAX_STALE};
pub use wire::{PushMessage, StratumNotify, StratumReq, StratumResp, MAX_REQ_SIZE};
