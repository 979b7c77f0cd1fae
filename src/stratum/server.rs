//! TCP/TLS listener, session registry and job broadcaster.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::BufReader as StdBufReader;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use futures::StreamExt;
use serde_json::json;
use tokio::io::ReadHalf;
use tokio::net::TcpListener;
use tokio::sync::{RwLock, Semaphore};
use tokio::time::Instant;
use tokio_rustls::{rustls, TlsAcceptor};
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::session::{BoxedTransport, Dialect, JobDetails, Session, KEEP_STALE, MAX_STALE};
use super::wire::{StratumNotify, StratumReq, MAX_REQ_SIZE};
use crate::config::Config;
use crate::policy::Policy;
use crate::upstream::{BlockTemplate, ShareSink, WorkSource};
use crate::util;

/// Broadcast fan-out worker cap.
const BROADCAST_WORKERS: usize = 1024;

type ExtranonceGen = Box<dyn Fn() -> String + Send + Sync>;

/// Session table and extranonce set, co-located under one lock so broadcast
/// snapshots stay consistent with registration.
pub(crate) struct Registry {
    pub sessions: HashMap<Uuid, Arc<Session>>,
    pub extranonces: HashSet<String>,
}

impl Registry {
    fn new() -> Self {
        Self {
            sessions: HashMap::new(),
            extranonces: HashSet::new(),
        }
    }

    /// Issue a process-unique extranonce, retrying the generator until the
    /// value is unheld. Runs under the registry write lock.
    pub(crate) fn issue_extranonce(&mut self, generator: &ExtranonceGen) -> String {
        loop {
            let candidate = generator();
            if self.extranonces.insert(candidate.clone()) {
                return candidate;
            }
        }
    }
}

pub struct StratumServer {
    pub(crate) config: Config,
    pub(crate) work: Arc<dyn WorkSource>,
    pub(crate) shares: Arc<dyn ShareSink>,
    pub(crate) policy: Arc<dyn Policy>,
    pub(crate) registry: RwLock<Registry>,
    timeout: Duration,
    diff_hex: String,
    conn_permits: Arc<Semaphore>,
    broadcast_permits: Arc<Semaphore>,
    extranonce_gen: ExtranonceGen,
}

impl StratumServer {
    pub fn new(
        config: Config,
        work: Arc<dyn WorkSource>,
        shares: Arc<dyn ShareSink>,
        policy: Arc<dyn Policy>,
    ) -> Result<Arc<Self>> {
        let timeout = util::parse_duration(&config.proxy.stratum.timeout)
            .context("stratum.timeout")?;
        let max_conn = config.proxy.stratum.max_conn.max(1);
        let diff_hex = util::target_hex(config.proxy.difficulty);
        Ok(Arc::new(Self {
            config,
            work,
            shares,
            policy,
            registry: RwLock::new(Registry::new()),
            timeout,
            diff_hex,
            conn_permits: Arc::new(Semaphore::new(max_conn)),
            broadcast_permits: Arc::new(Semaphore::new(BROADCAST_WORKERS)),
            extranonce_gen: Box::new(|| util::random_hex(4)),
        }))
    }

    pub async fn session_count(&self) -> usize {
        self.registry.read().await.sessions.len()
    }

    pub async fn bind(&self) -> Result<TcpListener> {
        let stratum = &self.config.proxy.stratum;
        let addr: SocketAddr = stratum
            .listen
            .parse()
            .with_context(|| format!("bad stratum.listen address {:?}", stratum.listen))?;
        let socket = socket2::Socket::new(
            socket2::Domain::for_address(addr),
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(1024)?;
        let listener = TcpListener::from_std(socket.into())?;
        info!(
            "📡 stratum listening on {}{}",
            stratum.listen,
            if stratum.tls { " (tls)" } else { "" }
        );
        Ok(listener)
    }

    fn tls_acceptor(&self) -> Result<Option<TlsAcceptor>> {
        let stratum = &self.config.proxy.stratum;
        if !stratum.tls {
            return Ok(None);
        }
        let certs = rustls_pemfile::certs(&mut StdBufReader::new(
            File::open(&stratum.cert_file)
                .with_context(|| format!("opening {}", stratum.cert_file))?,
        ))
        .collect::<std::result::Result<Vec<_>, _>>()?;
        let key = rustls_pemfile::private_key(&mut StdBufReader::new(
            File::open(&stratum.key_file)
                .with_context(|| format!("opening {}", stratum.key_file))?,
        ))?
        .ok_or_else(|| anyhow!("no private key in {}", stratum.key_file))?;
        let tls = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .context("building tls server config")?;
        Ok(Some(TlsAcceptor::from(Arc::new(tls))))
    }

    /// Accept loop. Admission is bounded: once `stratum.maxConn` reader tasks
    /// are live, accept stalls until one exits.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        let acceptor = self.tls_acceptor()?;
        loop {
            let (socket, peer) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    error!("accept failed: {}", e);
                    continue;
                }
            };
            let ip = peer.ip().to_string();

            // Policy gate runs before any protocol work.
            if self.policy.is_banned(&ip) || !self.policy.apply_limit(&ip) {
                drop(socket);
                continue;
            }

            let Ok(permit) = self.conn_permits.clone().acquire_owned().await else {
                bail!("connection semaphore closed");
            };
            let server = Arc::clone(&self);
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let _permit = permit;
                let transport: BoxedTransport = match &acceptor {
                    Some(tls) => match tls.accept(socket).await {
                        Ok(stream) => Box::new(stream),
                        Err(e) => {
                            debug!("tls handshake with {} failed: {}", ip, e);
                            return;
                        }
                    },
                    None => Box::new(socket),
                };
                server.run_session(ip, transport).await;
            });
        }
    }

    async fn run_session(self: &Arc<Self>, ip: String, transport: BoxedTransport) {
        let (reader, writer) = tokio::io::split(transport);
        let cs = {
            let mut registry = self.registry.write().await;
            let extranonce = registry.issue_extranonce(&self.extranonce_gen);
            let cs = Arc::new(Session::new(ip, extranonce, writer, self.timeout));
            registry.sessions.insert(cs.id, Arc::clone(&cs));
            cs
        };
        debug!("session {} registered for {}", cs.id, cs.ip);

        if let Err(e) = self.read_loop(&cs, reader).await {
            debug!("session {} closed: {:#}", cs.id, e);
        }
        self.remove_session(&cs).await;
        cs.shutdown().await;
    }

    async fn read_loop(&self, cs: &Arc<Session>, reader: ReadHalf<BoxedTransport>) -> Result<()> {
        // A line that fills the whole read buffer without a newline is a
        // flood, so the codec cap sits one under the buffer size.
        let mut frames = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_REQ_SIZE - 1));
        cs.touch();
        loop {
            let item = match tokio::time::timeout_at(cs.deadline(), frames.next()).await {
                Err(_) => {
                    // A broadcast push may have moved the deadline while this
                    // read was parked.
                    if cs.deadline() > Instant::now() {
                        continue;
                    }
                    bail!("idle timeout");
                }
                Ok(item) => item,
            };
            let line = match item {
                None => {
                    info!("client {} disconnected", cs.ip);
                    return Ok(());
                }
                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                    warn!("socket flood detected from {}", cs.ip);
                    self.policy.ban(&cs.ip);
                    bail!("request over {} bytes", MAX_REQ_SIZE);
                }
                Some(Err(LinesCodecError::Io(e))) => {
                    warn!("error reading from {}: {}", cs.ip, e);
                    return Err(e.into());
                }
                Some(Ok(line)) => line,
            };
            if line.len() <= 1 {
                continue;
            }
            let req: StratumReq = match serde_json::from_str(&line) {
                Ok(req) => req,
                Err(e) => {
                    warn!("malformed stratum request from {}: {}", cs.ip, e);
                    self.policy.record_malformed(&cs.ip);
                    bail!("malformed request");
                }
            };
            cs.touch();
            self.handle_message(cs, req).await?;
        }
    }

    /// Drop a session from the table and release its extranonce. Safe to
    /// call twice for the same session.
    pub(crate) async fn remove_session(&self, cs: &Arc<Session>) {
        let mut registry = self.registry.write().await;
        registry.sessions.remove(&cs.id);
        registry.extranonces.remove(&cs.extranonce);
    }

    /// Push the current template to every live session. Driven by the
    /// template watcher whenever the upstream header changes.
    pub async fn broadcast_new_jobs(self: &Arc<Self>) {
        let Some(template) = self.work.current_template().await else {
            return;
        };
        if template.header.is_empty() || self.work.is_sick() {
            return;
        }
        let work = [
            template.header.clone(),
            template.seed.clone(),
            self.diff_hex.clone(),
            util::to_hex(template.height),
        ];

        let sessions: Vec<Arc<Session>> = {
            let registry = self.registry.read().await;
            registry.sessions.values().cloned().collect()
        };
        info!("📢 broadcasting new job to {} stratum miners", sessions.len());
        let start = std::time::Instant::now();

        let mut workers = Vec::with_capacity(sessions.len());
        for cs in sessions {
            let Ok(permit) = self.broadcast_permits.clone().acquire_owned().await else {
                return;
            };
            let server = Arc::clone(self);
            let work = work.clone();
            let template = template.clone();
            workers.push(tokio::spawn(async move {
                let _permit = permit;
                match server.push_new_job(&cs, &work, &template).await {
                    Ok(()) => cs.touch(),
                    Err(e) => {
                        let login = cs.state.read().await.login.clone();
                        warn!("job transmit error to {}@{}: {:#}", login, cs.ip, e);
                        server.remove_session(&cs).await;
                        cs.shutdown().await;
                    }
                }
            }));
        }
        for worker in workers {
            let _ = worker.await;
        }
        info!("jobs broadcast finished in {:?}", start.elapsed());
    }

    /// Broadcast-path job delivery for one session. NiceHash sessions get a
    /// fresh job id with `clean_jobs=false` so miners keep draining queued
    /// work; EthProxy sessions get the legacy push shape.
    pub(crate) async fn push_new_job(
        &self,
        cs: &Arc<Session>,
        work: &[String; 4],
        template: &BlockTemplate,
    ) -> Result<()> {
        if cs.dialect().await == Dialect::NiceHash {
            let job = JobDetails {
                job_id: util::random_hex(8),
                seed_hash: util::strip_0x(&work[1]).to_string(),
                header_hash: util::strip_0x(&work[0]).to_string(),
                height: work[3].clone(),
            };
            {
                let mut state = cs.state.write().await;
                state.cache_stales(MAX_STALE, KEEP_STALE);
                state.job_current = Some(job.clone());
            }
            return cs
                .send_request(&StratumNotify {
                    id: None,
                    method: "mining.notify",
                    params: json!([job.job_id, job.seed_hash, job.header_hash, false]),
                    height: Some(util::to_hex(template.height)),
                    algo: Some(self.config.algo.clone()),
                })
                .await;
        }
        cs.send_push(json!(work)).await
    }
}
