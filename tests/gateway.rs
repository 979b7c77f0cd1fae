//! End-to-end gateway scenarios over real sockets: dialect detection, job
//! flow, stale-share handling, policy enforcement and broadcast fan-out.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::RwLock;

use ethergate::config::Config;
use ethergate::policy::Policy;
use ethergate::stratum::StratumServer;
use ethergate::upstream::{BlockTemplate, ErrorReply, ShareSink, WorkSource};
use ethergate::util;

const LOGIN: &str = "0xb85150eb365e7df0941f0cf08235f987ba91506a";

struct TestWork {
    template: RwLock<Option<BlockTemplate>>,
    diff_hex: String,
}

impl TestWork {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            template: RwLock::new(None),
            diff_hex: util::target_hex(2_000_000_000),
        })
    }

    async fn set_template(&self, template: BlockTemplate) {
        *self.template.write().await = Some(template);
    }
}

#[async_trait]
impl WorkSource for TestWork {
    async fn login(&self, login: &str, _worker: &str) -> Result<bool, ErrorReply> {
        if login.starts_with("0x") {
            Ok(true)
        } else {
            Err(ErrorReply::new(-1, "Invalid login"))
        }
    }

    async fn get_work(&self) -> Result<[String; 4], ErrorReply> {
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
        false
    }
}

#[derive(Default)]
struct TestSink {
    submissions: Mutex<Vec<(String, String, [String; 3])>>,
}

#[async_trait]
impl ShareSink for TestSink {
    async fn submit(
        &self,
        login: &str,
        worker: &str,
        _ip: &str,
        params: [String; 3],
    ) -> Result<bool, ErrorReply> {
        self.submissions
            .lock()
            .unwrap()
            .push((login.to_string(), worker.to_string(), params));
        Ok(true)
    }
}

#[derive(Default)]
struct TestPolicy {
    banned: Mutex<HashSet<String>>,
    malformed: Mutex<Vec<String>>,
}

impl Policy for TestPolicy {
    fn is_banned(&self, ip: &str) -> bool {
        self.banned.lock().unwrap().contains(ip)
    }

    fn apply_limit(&self, _ip: &str) -> bool {
        true
    }

    fn ban(&self, ip: &str) {
        self.banned.lock().unwrap().insert(ip.to_string());
    }

    fn record_malformed(&self, ip: &str) {
        self.malformed.lock().unwrap().push(ip.to_string());
    }
}

struct Gateway {
    server: Arc<StratumServer>,
    addr: SocketAddr,
    work: Arc<TestWork>,
    sink: Arc<TestSink>,
    policy: Arc<TestPolicy>,
}

async fn start_gateway() -> Gateway {
    let mut config = Config::default();
    config.proxy.stratum.listen = "127.0.0.1:0".to_string();
    config.proxy.stratum.timeout = "5s".to_string();
    let work = TestWork::new();
    let sink = Arc::new(TestSink::default());
    let policy = Arc::new(TestPolicy::default());
    let server = StratumServer::new(config, work.clone(), sink.clone(), policy.clone()).unwrap();
    let listener = server.bind().await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(Arc::clone(&server).serve(listener));
    Gateway {
        server,
        addr,
        work,
        sink,
        policy,
    }
}

fn template(height: u64) -> BlockTemplate {
    BlockTemplate {
        header: format!("0x{:064x}", height + 0xa1),
        seed: format!("0x{:064x}", height + 0xb2),
        height,
        difficulty_hex: util::target_hex(2_000_000_000),
    }
}

struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (reader, writer) = stream.into_split();
        Self {
            reader: BufReader::new(reader),
            writer,
        }
    }

    async fn send(&mut self, frame: Value) {
        let mut line = frame.to_string();
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await.unwrap();
    }

    async fn send_raw(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.unwrap();
        self.writer.flush().await.unwrap();
    }

    async fn recv(&mut self) -> Value {
        let mut line = String::new();
        let n = tokio::time::timeout(Duration::from_secs(5), self.reader.read_line(&mut line))
            .await
            .expect("read timed out")
            .expect("read failed");
        assert!(n > 0, "connection closed while expecting a frame");
        serde_json::from_str(&line).expect("frame is not valid json")
    }

    /// True when the server closed the connection (clean EOF or reset).
    async fn read_eof(&mut self) -> bool {
        let mut line = String::new();
        matches!(
            tokio::time::timeout(Duration::from_secs(5), self.reader.read_line(&mut line)).await,
            Ok(Ok(0)) | Ok(Err(_))
        )
    }
}

fn subscribe_frame(id: u64) -> Value {
    json!({"id": id, "method": "mining.subscribe", "params": ["miner/1", "EthereumStratum/1.0.0"]})
}

fn authorize_frame(id: u64) -> Value {
    json!({"id": id, "method": "mining.authorize", "params": [format!("{}.rig1", LOGIN), "x"]})
}

/// Subscribe + authorize, returning the session extranonce and the first
/// job id. Call with no template set so the subscribe reply carries the
/// paired shape.
async fn nicehash_session(gw: &Gateway, client: &mut Client, first_template: BlockTemplate) -> (String, String) {
    client.send(subscribe_frame(1)).await;
    let reply = client.recv().await;
    let extranonce = reply["result"][1].as_str().unwrap().to_string();

    gw.work.set_template(first_template).await;
    client.send(authorize_frame(2)).await;
    let reply = client.recv().await;
    assert_eq!(reply, json!({"id": 2, "result": true, "error": null}));

    let diff = client.recv().await;
    assert_eq!(diff["method"], json!("mining.set_difficulty"));

    let notify = client.recv().await;
    assert_eq!(notify["method"], json!("mining.notify"));
    let job_id = notify["params"][0].as_str().unwrap().to_string();
    (extranonce, job_id)
}

#[tokio::test]
async fn ethproxy_login_and_getwork() {
    let gw = start_gateway().await;
    gw.work.set_template(template(0x1d4c00)).await;

    let mut client = Client::connect(gw.addr).await;
    client
        .send(json!({"id": 1, "method": "eth_submitLogin", "params": [LOGIN, "x"]}))
        .await;
    let reply = client.recv().await;
    assert_eq!(
        reply,
        json!({"id": 1, "jsonrpc": "2.0", "result": true, "error": null})
    );

    client
        .send(json!({"id": 2, "method": "eth_getWork", "params": []}))
        .await;
    let reply = client.recv().await;
    assert_eq!(reply["id"], json!(2));
    assert_eq!(reply["jsonrpc"], json!("2.0"));
    let result = reply["result"].as_array().unwrap();
    assert_eq!(result.len(), 4);
    assert_eq!(result[0], json!(format!("0x{:064x}", 0x1d4c00 + 0xa1)));
    assert_eq!(result[1], json!(format!("0x{:064x}", 0x1d4c00 + 0xb2)));
    assert_eq!(result[3], json!("0x1d4c00"));
}

#[tokio::test]
async fn nicehash_subscribe_authorize_and_first_job() {
    let gw = start_gateway().await;
    let mut client = Client::connect(gw.addr).await;

    client.send(subscribe_frame(1)).await;
    let reply = client.recv().await;
    assert_eq!(reply["id"], json!(1));
    assert!(reply["error"].is_null());
    assert!(reply.get("jsonrpc").is_none());
    let result = reply["result"].as_array().unwrap();
    let notify_info = result[0].as_array().unwrap();
    assert_eq!(notify_info[0], json!("mining.notify"));
    assert_eq!(notify_info[1].as_str().unwrap().len(), 16);
    assert_eq!(notify_info[2], json!("EthereumStratum/1.0.0"));
    let extranonce = result[1].as_str().unwrap();
    assert_eq!(extranonce.len(), 4);

    gw.work.set_template(template(100)).await;
    client.send(authorize_frame(2)).await;
    let reply = client.recv().await;
    assert_eq!(reply, json!({"id": 2, "result": true, "error": null}));

    let diff = client.recv().await;
    assert_eq!(diff["method"], json!("mining.set_difficulty"));
    assert!(diff["params"][0].as_f64().unwrap() > 0.0);
    assert!(diff.get("id").is_none());

    let notify = client.recv().await;
    assert_eq!(notify["method"], json!("mining.notify"));
    let params = notify["params"].as_array().unwrap();
    assert_eq!(params[0].as_str().unwrap().len(), 8);
    assert_eq!(params[1], json!(format!("{:064x}", 100 + 0xb2)));
    assert_eq!(params[2], json!(format!("{:064x}", 100 + 0xa1)));
    assert_eq!(params[3], json!(true));
    assert_eq!(notify["height"], json!("0x64"));
    assert_eq!(notify["algo"], json!("etchash"));
}

#[tokio::test]
async fn subscribe_reply_flattens_when_template_is_live() {
    let gw = start_gateway().await;
    gw.work.set_template(template(9)).await;

    let mut client = Client::connect(gw.addr).await;
    client.send(subscribe_frame(1)).await;
    let reply = client.recv().await;
    let result = reply["result"].as_array().unwrap();
    assert_eq!(result.len(), 5);
    assert_eq!(result[0], json!("mining.notify"));
    assert_eq!(result[1].as_str().unwrap().len(), 8);
    assert_eq!(result[2], json!(format!("0x{:064x}", 9 + 0xb2)));
    assert_eq!(result[3], json!(format!("0x{:064x}", 9 + 0xa1)));
    assert_eq!(result[4], json!("0x9"));
}

#[tokio::test]
async fn stale_shares_use_the_cached_job() {
    let gw = start_gateway().await;
    let mut client = Client::connect(gw.addr).await;
    let (extranonce, job1) = nicehash_session(&gw, &mut client, template(1)).await;

    // A broadcast supersedes job1 but parks it in the stale cache.
    gw.work.set_template(template(2)).await;
    gw.server.broadcast_new_jobs().await;
    let notify = client.recv().await;
    assert_eq!(notify["params"][3], json!(false));
    let job2 = notify["params"][0].as_str().unwrap().to_string();
    assert_ne!(job1, job2);

    // Share against the superseded job: forwarded with the cached hashes.
    client
        .send(json!({"id": 10, "method": "mining.submit",
            "params": [format!("{}.rig1", LOGIN), job1, "aabbccdd00112233"]}))
        .await;
    let reply = client.recv().await;
    assert_eq!(reply, json!({"id": 10, "result": true, "error": null}));
    {
        let submissions = gw.sink.submissions.lock().unwrap();
        let (login, worker, params) = submissions.last().unwrap().clone();
        assert_eq!(login, LOGIN);
        assert_eq!(worker, "rig1");
        assert_eq!(params[0], format!("{}aabbccdd00112233", extranonce));
        assert_eq!(params[1], format!("{:064x}", 1 + 0xb2));
        assert_eq!(params[2], format!("{:064x}", 1 + 0xa1));
    }

    // Share against the active job: forwarded with the current hashes.
    client
        .send(json!({"id": 11, "method": "mining.submit",
            "params": [format!("{}.rig1", LOGIN), job2, "aabbccdd00112233"]}))
        .await;
    let reply = client.recv().await;
    assert_eq!(reply, json!({"id": 11, "result": true, "error": null}));
    {
        let submissions = gw.sink.submissions.lock().unwrap();
        let (_, _, params) = submissions.last().unwrap().clone();
        assert_eq!(params[1], format!("{:064x}", 2 + 0xb2));
        assert_eq!(params[2], format!("{:064x}", 2 + 0xa1));
    }

    // Unknown job id: stale error followed by an immediate fresh job.
    client
        .send(json!({"id": 12, "method": "mining.submit",
            "params": [format!("{}.rig1", LOGIN), "00000000", "aabbccdd00112233"]}))
        .await;
    let reply = client.recv().await;
    assert_eq!(
        reply,
        json!({"id": 12, "result": null, "error": ["21", "Stale share."]})
    );
    let refresh = client.recv().await;
    assert_eq!(refresh["method"], json!("mining.notify"));
    assert_eq!(refresh["params"][3], json!(true));
}

#[tokio::test]
async fn oversized_line_bans_the_ip() {
    let gw = start_gateway().await;
    let mut client = Client::connect(gw.addr).await;
    client.send_raw(&vec![b'x'; 2000]).await;
    assert!(client.read_eof().await);
    assert!(gw.policy.is_banned("127.0.0.1"));

    // Subsequent accepts from the banned IP are closed immediately.
    let mut again = Client::connect(gw.addr).await;
    assert!(again.read_eof().await);
}

#[tokio::test]
async fn malformed_json_is_recorded_and_closes() {
    let gw = start_gateway().await;
    let mut client = Client::connect(gw.addr).await;
    client.send_raw(b"{this is not json}\n").await;
    assert!(client.read_eof().await);
    assert_eq!(
        *gw.policy.malformed.lock().unwrap(),
        vec!["127.0.0.1".to_string()]
    );
}

#[tokio::test]
async fn unknown_method_before_dialect_selection_closes() {
    let gw = start_gateway().await;
    gw.work.set_template(template(5)).await;
    let mut client = Client::connect(gw.addr).await;
    client
        .send(json!({"id": 1, "method": "eth_getWork", "params": []}))
        .await;
    let reply = client.recv().await;
    assert_eq!(
        reply,
        json!({"id": 1, "jsonrpc": "2.0", "result": null,
               "error": {"code": -3, "message": "Method not found"}})
    );
    assert!(client.read_eof().await);
}

#[tokio::test]
async fn unsupported_subscribe_version_keeps_session_alive() {
    let gw = start_gateway().await;
    let mut client = Client::connect(gw.addr).await;
    client
        .send(json!({"id": 1, "method": "mining.subscribe", "params": ["miner/1", "EthereumStratum/2.0.0"]}))
        .await;
    let reply = client.recv().await;
    assert_eq!(
        reply,
        json!({"id": 1, "result": null, "error": "unsupported stratum version"})
    );

    // The session survives and a proper subscribe still works.
    client.send(subscribe_frame(2)).await;
    let reply = client.recv().await;
    assert!(reply["error"].is_null());
}

#[tokio::test]
async fn extranonce_subscribe_with_params_is_rejected_politely() {
    let gw = start_gateway().await;
    let mut client = Client::connect(gw.addr).await;
    let (extranonce, _) = nicehash_session(&gw, &mut client, template(3)).await;

    client
        .send(json!({"id": 5, "method": "mining.extranonce.subscribe", "params": ["x"]}))
        .await;
    let reply = client.recv().await;
    assert_eq!(
        reply,
        json!({"id": 5, "result": null, "error": ["20", "Not supported."]})
    );

    // Parameterless form succeeds and re-announces the extranonce.
    client
        .send(json!({"id": 6, "method": "mining.extranonce.subscribe", "params": []}))
        .await;
    let reply = client.recv().await;
    assert_eq!(reply, json!({"id": 6, "result": true, "error": null}));
    let push = client.recv().await;
    assert_eq!(push["method"], json!("mining.set_extranonce"));
    assert_eq!(push["params"], json!([extranonce]));
}

#[tokio::test]
async fn submit_work_length_validation_closes_session() {
    let gw = start_gateway().await;
    gw.work.set_template(template(4)).await;
    let mut client = Client::connect(gw.addr).await;
    client
        .send(json!({"id": 1, "method": "eth_submitLogin", "params": [LOGIN]}))
        .await;
    client.recv().await;

    client
        .send(json!({"id": 2, "method": "eth_submitWork",
            "params": ["0x1234", format!("0x{:064x}", 1u64), format!("0x{:064x}", 2u64)]}))
        .await;
    let reply = client.recv().await;
    assert_eq!(reply["error"]["message"], json!("Invalid params"));
    assert!(client.read_eof().await);
    assert!(gw.sink.submissions.lock().unwrap().is_empty());
}

#[tokio::test]
async fn well_formed_submit_work_is_forwarded() {
    let gw = start_gateway().await;
    gw.work.set_template(template(4)).await;
    let mut client = Client::connect(gw.addr).await;
    client
        .send(json!({"id": 1, "method": "eth_submitLogin", "params": [LOGIN], "worker": "rig7"}))
        .await;
    client.recv().await;

    let nonce = format!("0x{:016x}", 0xdeadbeefu64);
    let pow_hash = format!("0x{:064x}", 77u64);
    let digest = format!("0x{:064x}", 88u64);
    client
        .send(json!({"id": 2, "method": "eth_submitWork",
            "params": [nonce, pow_hash, digest], "worker": "rig7"}))
        .await;
    let reply = client.recv().await;
    assert_eq!(
        reply,
        json!({"id": 2, "jsonrpc": "2.0", "result": true, "error": null})
    );
    let submissions = gw.sink.submissions.lock().unwrap();
    let (login, worker, params) = submissions.last().unwrap().clone();
    assert_eq!(login, LOGIN);
    assert_eq!(worker, "rig7");
    assert_eq!(params[0], nonce);
}

#[tokio::test]
async fn hashrate_report_requires_hex_prefix() {
    let gw = start_gateway().await;
    let mut client = Client::connect(gw.addr).await;
    client
        .send(json!({"id": 1, "method": "eth_submitLogin", "params": [LOGIN]}))
        .await;
    client.recv().await;

    client
        .send(json!({"id": 2, "method": "eth_submitHashrate", "params": ["0x1e84800", "rig-id"]}))
        .await;
    let reply = client.recv().await;
    assert_eq!(
        reply,
        json!({"id": 2, "jsonrpc": "2.0", "result": true, "error": null})
    );

    client
        .send(json!({"id": 3, "method": "eth_submitHashrate", "params": ["1e84800", "rig-id"]}))
        .await;
    let reply = client.recv().await;
    assert_eq!(reply["error"]["message"], json!("Malformed hashrate value"));
    assert!(client.read_eof().await);
}

#[tokio::test]
async fn broadcast_reaches_every_session_once() {
    let gw = start_gateway().await;

    let mut nicehash = Vec::new();
    for n in 0..8 {
        let mut client = Client::connect(gw.addr).await;
        let _ = nicehash_session(&gw, &mut client, template(7 + n)).await;
        nicehash.push(client);
    }

    let mut ethproxy = Vec::new();
    for _ in 0..4 {
        let mut client = Client::connect(gw.addr).await;
        client
            .send(json!({"id": 1, "method": "eth_submitLogin", "params": [LOGIN]}))
            .await;
        client.recv().await;
        ethproxy.push(client);
    }

    assert_eq!(gw.server.session_count().await, 12);

    gw.work.set_template(template(1000)).await;
    gw.server.broadcast_new_jobs().await;

    let mut job_ids = HashSet::new();
    for client in &mut nicehash {
        let notify = client.recv().await;
        assert_eq!(notify["method"], json!("mining.notify"));
        assert_eq!(notify["params"][3], json!(false));
        assert_eq!(notify["height"], json!("0x3e8"));
        job_ids.insert(notify["params"][0].as_str().unwrap().to_string());
    }
    // Job ids are generated per miner per push.
    assert_eq!(job_ids.len(), 8);

    for client in &mut ethproxy {
        let push = client.recv().await;
        assert_eq!(push["jsonrpc"], json!("2.0"));
        assert_eq!(push["id"], json!(0));
        let result = push["result"].as_array().unwrap();
        assert_eq!(result[0], json!(format!("0x{:064x}", 1000 + 0xa1)));
        assert_eq!(result[3], json!("0x3e8"));
    }
}

#[tokio::test]
async fn every_live_session_has_a_distinct_extranonce() {
    let gw = start_gateway().await;
    let mut extranonces = HashSet::new();
    let mut clients = Vec::new();
    for _ in 0..16 {
        let mut client = Client::connect(gw.addr).await;
        client.send(subscribe_frame(1)).await;
        let reply = client.recv().await;
        let extranonce = reply["result"][1].as_str().unwrap().to_string();
        assert!(extranonces.insert(extranonce), "duplicate extranonce issued");
        clients.push(client);
    }
}
