//! Protocol state machine: dispatch of each incoming method by
//! (dialect, method).
//!
//! The three dialect-selecting methods (`eth_submitLogin`, `mining.subscribe`
//! and, for authentication only, `eth_login`) are handled regardless of
//! dialect; everything else routes through the dialect the session settled
//! on. While the dialect is still unset every other method is an unknown
//! method.

use std::sync::Arc;

use anyhow::{bail, Result};
use serde_json::{json, Value};
use tracing::{info, warn};

use super::server::StratumServer;
use super::session::{Dialect, JobDetails, Session};
use super::wire::{StratumNotify, StratumReq};
use crate::upstream::ErrorReply;
use crate::util;

fn unknown_method(method: &str) -> ErrorReply {
    warn!("unknown rpc method {:?}", method);
    ErrorReply::new(-3, "Method not found")
}

impl StratumServer {
    pub(crate) async fn handle_message(&self, cs: &Arc<Session>, req: StratumReq) -> Result<()> {
        match req.method.as_str() {
            // Claymore -esm 1: authenticates without selecting a dialect.
            "eth_login" => {
                let params = self.require_string_params(cs, &req, 1).await?;
                match self.authenticate(cs, &params, &req.worker).await {
                    Err(reply) => cs.send_error(req.id, &reply).await,
                    Ok(result) => cs.send_result(req.id, Value::Bool(result)).await,
                }
            }
            // Claymore -esm 0
            "eth_submitLogin" => {
                let params = self.require_string_params(cs, &req, 1).await?;
                match self.authenticate(cs, &params, &req.worker).await {
                    Err(reply) => cs.send_error(req.id, &reply).await,
                    Ok(result) => {
                        cs.state.write().await.set_dialect(Dialect::EthProxy);
                        info!("ethproxy login from {}: {}", cs.ip, params[0]);
                        cs.send_result(req.id, Value::Bool(result)).await
                    }
                }
            }
            "mining.subscribe" => {
                let params = self.require_string_params(cs, &req, 2).await?;
                if params[1] != "EthereumStratum/1.0.0" && params[0] != "GodMiner/2.0.0" {
                    warn!("unsupported stratum version from {}", cs.ip);
                    return cs
                        .send_stratum_error(req.id, json!("unsupported stratum version"))
                        .await;
                }
                {
                    let mut state = cs.state.write().await;
                    state.extranonce_subscribed = true;
                    state.set_dialect(Dialect::NiceHash);
                }
                info!("nicehash subscribe from {}", cs.ip);
                let result = self.notification_response(cs).await;
                cs.send_stratum_result(req.id, result).await
            }
            _ => match cs.dialect().await {
                Dialect::Unset => {
                    let reply = unknown_method(&req.method);
                    cs.send_error(req.id, &reply).await
                }
                Dialect::NiceHash => self.handle_nicehash(cs, req).await,
                Dialect::EthProxy => self.handle_ethproxy(cs, req).await,
            },
        }
    }

    async fn handle_nicehash(&self, cs: &Arc<Session>, req: StratumReq) -> Result<()> {
        match req.method.as_str() {
            "mining.authorize" => {
                let mut params = self.require_string_params(cs, &req, 1).await?;
                // user.worker: authenticate against the user part only.
                params[0] = params[0]
                    .split('.')
                    .next()
                    .unwrap_or_default()
                    .to_string();
                match self.authenticate(cs, &params, &req.worker).await {
                    Err(reply) => {
                        return cs
                            .send_stratum_error(req.id, stratum_error_value(&reply))
                            .await;
                    }
                    Ok(result) => {
                        cs.send_stratum_result(req.id.clone(), Value::Bool(result))
                            .await?
                    }
                }
                let difficulty = util::diff_to_float(self.config.proxy.difficulty);
                cs.send_request(&StratumNotify {
                    id: None,
                    method: "mining.set_difficulty",
                    params: json!([difficulty]),
                    height: None,
                    algo: None,
                })
                .await?;
                self.send_job(cs, req.id, true).await
            }
            "mining.extranonce.subscribe" => {
                let params = self.require_string_params(cs, &req, 0).await?;
                if params.is_empty() {
                    cs.send_stratum_result(req.id, Value::Bool(true)).await?;
                    cs.state.write().await.extranonce_subscribed = true;
                    return cs
                        .send_request(&StratumNotify {
                            id: None,
                            method: "mining.set_extranonce",
                            params: json!([cs.extranonce.clone()]),
                            height: None,
                            algo: None,
                        })
                        .await;
                }
                cs.send_stratum_error(req.id, json!(["20", "Not supported."]))
                    .await
            }
            "mining.submit" => self.handle_nicehash_submit(cs, req).await,
            _ => {
                let reply = unknown_method(&req.method);
                cs.send_stratum_error(req.id, stratum_error_value(&reply))
                    .await
            }
        }
    }

    /// `mining.submit` params: [user.workerName, jobID, minerNonce].
    async fn handle_nicehash_submit(&self, cs: &Arc<Session>, req: StratumReq) -> Result<()> {
        let params = self.require_string_params(cs, &req, 3).await?;

        let worker = params[0]
            .splitn(2, '.')
            .nth(1)
            .unwrap_or("0")
            .to_string();

        let (prefix, current, stale) = {
            let mut state = cs.state.write().await;
            state.worker = worker.clone();
            let prefix = if state.extranonce_subscribed {
                cs.extranonce.clone()
            } else {
                String::new()
            };
            (prefix, state.job_current.clone(), state.stale_job(&params[1]))
        };
        let nonce = format!("{}{}", prefix, params[2]);

        let current_id = current
            .as_ref()
            .map(|job| job.job_id.clone())
            .unwrap_or_default();
        let submit = if let Some(job) = current.filter(|job| job.job_id == params[1]) {
            [nonce, job.seed_hash, job.header_hash]
        } else if let Some((seed_hash, header_hash)) = stale {
            info!("cached stale job {} from {}", params[1], cs.ip);
            [nonce, seed_hash, header_hash]
        } else {
            warn!(
                "stale share from {} (job {} != current {})",
                cs.ip, params[1], current_id
            );
            cs.send_stratum_error(req.id.clone(), json!(["21", "Stale share."]))
                .await?;
            return self.send_job(cs, req.id, false).await;
        };

        let login = cs.state.read().await.login.clone();
        match self.shares.submit(&login, &worker, &cs.ip, submit).await {
            Err(reply) => {
                warn!("share rejected upstream for {}@{}", login, cs.ip);
                cs.send_stratum_error(req.id, stratum_error_value(&reply))
                    .await
            }
            Ok(result) => cs.send_stratum_result(req.id, Value::Bool(result)).await,
        }
    }

    async fn handle_ethproxy(&self, cs: &Arc<Session>, req: StratumReq) -> Result<()> {
        match req.method.as_str() {
            "eth_getWork" => match self.work.get_work().await {
                Err(reply) => cs.send_error(req.id, &reply).await,
                Ok(work) => cs.send_result(req.id, json!(work)).await,
            },
            "eth_submitWork" => {
                let params = self.require_string_params(cs, &req, 3).await?;
                if params[0].len() != 18 || params[1].len() != 66 || params[2].len() != 66 {
                    warn!("malformed eth_submitWork params from {}", cs.ip);
                    let _ = cs
                        .send_error(req.id, &ErrorReply::new(-1, "Invalid params"))
                        .await;
                    bail!("malformed eth_submitWork params");
                }
                let login = cs.state.read().await.login.clone();
                let submit = [params[0].clone(), params[1].clone(), params[2].clone()];
                match self.shares.submit(&login, &req.worker, &cs.ip, submit).await {
                    Err(reply) => cs.send_error(req.id, &reply).await,
                    Ok(result) => cs.send_result(req.id, Value::Bool(result)).await,
                }
            }
            "eth_submitHashrate" => {
                let params = self.require_string_params(cs, &req, 2).await?;
                let rate = params[0]
                    .strip_prefix("0x")
                    .and_then(|hex| i64::from_str_radix(hex, 16).ok());
                let Some(rate) = rate else {
                    warn!("malformed hashrate value from {}", cs.ip);
                    return cs
                        .send_error(req.id, &ErrorReply::new(-1, "Malformed hashrate value"))
                        .await;
                };
                {
                    let state = cs.state.read().await;
                    info!(
                        "hashrate reported by {}@{} ({}): {}",
                        state.worker,
                        cs.ip,
                        state.login,
                        util::format_hashrate(rate)
                    );
                }
                cs.send_result(req.id, Value::Bool(true)).await
            }
            _ => {
                let reply = unknown_method(&req.method);
                cs.send_error(req.id, &reply).await
            }
        }
    }

    /// Delegate authentication to the work source and record the identity on
    /// success.
    async fn authenticate(
        &self,
        cs: &Arc<Session>,
        params: &[String],
        worker: &str,
    ) -> Result<bool, ErrorReply> {
        let login = params[0].to_lowercase();
        let reply = self.work.login(&login, worker).await?;
        {
            let mut state = cs.state.write().await;
            state.login = login.clone();
            state.worker = worker.to_string();
        }
        info!("stratum miner connected {}@{}", login, cs.ip);
        Ok(reply)
    }

    /// Parse `params` as a string array of at least `min` elements; on
    /// failure reply with a malformed-params error in the session's dialect
    /// and terminate.
    async fn require_string_params(
        &self,
        cs: &Arc<Session>,
        req: &StratumReq,
        min: usize,
    ) -> Result<Vec<String>> {
        let parsed: Option<Vec<String>> = serde_json::from_value(req.params.clone()).ok();
        match parsed {
            Some(params) if params.len() >= min => Ok(params),
            _ => {
                warn!("malformed stratum request params from {}", cs.ip);
                let reply = ErrorReply::new(-1, "Invalid params");
                match cs.dialect().await {
                    Dialect::NiceHash => {
                        let _ = cs
                            .send_stratum_error(req.id.clone(), stratum_error_value(&reply))
                            .await;
                    }
                    _ => {
                        let _ = cs.send_error(req.id.clone(), &reply).await;
                    }
                }
                bail!("malformed params for {}", req.method)
            }
        }
    }

    /// Reply body for `mining.subscribe`.
    ///
    /// Compatibility quirk kept from deployed gateways: when a template is
    /// live, the paired `[[notify-info], extranonce]` shape collapses into a
    /// flat notify array.
    async fn notification_response(&self, cs: &Arc<Session>) -> Value {
        let mut result = json!([
            ["mining.notify", util::random_hex(16), "EthereumStratum/1.0.0"],
            cs.extranonce.clone(),
        ]);
        if cs.dialect().await == Dialect::NiceHash {
            if let Some(template) = self.work.current_template().await {
                result = json!([
                    "mining.notify",
                    util::random_hex(8),
                    template.seed,
                    template.header,
                    util::to_hex(template.height),
                ]);
            }
        }
        result
    }

    /// Targeted NiceHash job push. `new` fetches fresh work and replaces the
    /// active job; otherwise the current job is re-announced.
    pub(crate) async fn send_job(&self, cs: &Arc<Session>, id: Value, new: bool) -> Result<()> {
        if new {
            let work = match self.work.get_work().await {
                Err(reply) => {
                    return cs
                        .send_stratum_error(id, stratum_error_value(&reply))
                        .await;
                }
                Ok(work) => work,
            };
            let job = JobDetails {
                job_id: util::random_hex(8),
                seed_hash: util::strip_0x(&work[1]).to_string(),
                header_hash: util::strip_0x(&work[0]).to_string(),
                height: work[3].clone(),
            };
            cs.state.write().await.job_current = Some(job);
        }

        let job = cs.state.read().await.job_current.clone();
        let Some(job) = job else {
            // Nothing to announce before the first job was assigned.
            return Ok(());
        };
        let height = match self.work.current_template().await {
            Some(template) => util::to_hex(template.height),
            None => job.height.clone(),
        };
        cs.send_request(&StratumNotify {
            id: None,
            method: "mining.notify",
            params: json!([job.job_id, job.seed_hash, job.header_hash, true]),
            height: Some(height),
            algo: Some(self.config.algo.clone()),
        })
        .await
    }
}

/// NiceHash error encoding: a `[code, message]` array with a stringified
/// code.
fn stratum_error_value(reply: &ErrorReply) -> Value {
    json!([reply.code.to_string(), reply.message.clone()])
}
