//! Shared fixtures: a scripted Electrum server over real TCP plus a
//! fully wired wallet talking to it.
#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpListener;
use tokio::time::sleep;

use filament_wallet::builder::TransactionBuilder;
use filament_wallet::config::PolicyConfig;
use filament_wallet::electrum::{Connection, Provider, TxCache};
use filament_wallet::events;
use filament_wallet::keys::{Chain, DerivedKey, HdPath, KeyManager, Network, SeedKeyManager};
use filament_wallet::ledger::AddressLedger;
use filament_wallet::store::{KvStore, MemoryStore};
use filament_wallet::sync::SyncManager;

pub const TEST_SEED: [u8; 32] = [7u8; 32];

/// One input of a scripted transaction.
#[derive(Clone)]
pub enum MockVin {
    Coinbase,
    Prev { txid: String, vout: u32 },
}

/// One scripted transaction: outputs as `(address, sats)`, `None`
/// address marks a non-standard script.
#[derive(Clone)]
pub struct MockTx {
    pub height: Option<u64>,
    pub vin: Vec<MockVin>,
    pub vout: Vec<(Option<String>, u64)>,
}

#[derive(Default)]
struct ServerState {
    tip: u64,
    history: HashMap<String, Vec<String>>,
    mempool: HashMap<String, Vec<String>>,
    txs: HashMap<String, MockTx>,
    broadcast_error: Option<String>,
    broadcasts: Vec<String>,
    requests: Vec<(String, String)>,
}

/// Scripted Electrum server backed by a real TCP listener.
#[derive(Clone)]
pub struct MockServer {
    pub addr: SocketAddr,
    state: Arc<Mutex<ServerState>>,
    clients: Arc<Mutex<Vec<Arc<tokio::sync::Mutex<OwnedWriteHalf>>>>>,
}

impl MockServer {
    pub async fn start(tip: u64) -> MockServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let state = Arc::new(Mutex::new(ServerState {
            tip,
            ..ServerState::default()
        }));
        let clients: Arc<Mutex<Vec<Arc<tokio::sync::Mutex<OwnedWriteHalf>>>>> =
            Arc::new(Mutex::new(Vec::new()));

        let accept_state = Arc::clone(&state);
        let accept_clients = Arc::clone(&clients);
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let (read_half, write_half) = stream.into_split();
                let writer = Arc::new(tokio::sync::Mutex::new(write_half));
                accept_clients.lock().push(Arc::clone(&writer));
                let state = Arc::clone(&accept_state);
                tokio::spawn(async move {
                    let mut reader = BufReader::new(read_half);
                    let mut line = String::new();
                    loop {
                        line.clear();
                        match reader.read_line(&mut line).await {
                            Ok(0) | Err(_) => break,
                            Ok(_) => {}
                        }
                        let Ok(request) = serde_json::from_str::<Value>(&line) else {
                            continue;
                        };
                        let id = request["id"].clone();
                        let method = request["method"].as_str().unwrap_or_default().to_string();
                        let params = request["params"].clone();
                        let reply = match handle_request(&state, &method, &params) {
                            Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
                            Err(error) => json!({"jsonrpc": "2.0", "id": id, "error": error}),
                        };
                        let mut frame = reply.to_string();
                        frame.push('\n');
                        if writer
                            .lock()
                            .await
                            .write_all(frame.as_bytes())
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                });
            }
        });

        MockServer {
            addr,
            state,
            clients,
        }
    }

    pub fn tip(&self) -> u64 {
        self.state.lock().tip
    }

    pub fn add_tx(&self, txid: &str, tx: MockTx) {
        self.state.lock().txs.insert(txid.to_string(), tx);
    }

    pub fn add_confirmed(&self, script_hash_hex: &str, txid: &str) {
        self.state
            .lock()
            .history
            .entry(script_hash_hex.to_string())
            .or_default()
            .push(txid.to_string());
    }

    pub fn add_mempool(&self, script_hash_hex: &str, txid: &str) {
        self.state
            .lock()
            .mempool
            .entry(script_hash_hex.to_string())
            .or_default()
            .push(txid.to_string());
    }

    /// Move a mempool transaction into a block.
    pub fn confirm_tx(&self, script_hash_hex: &str, txid: &str, height: u64) {
        let mut state = self.state.lock();
        if let Some(entries) = state.mempool.get_mut(script_hash_hex) {
            entries.retain(|known| known != txid);
        }
        state
            .history
            .entry(script_hash_hex.to_string())
            .or_default()
            .push(txid.to_string());
        if let Some(tx) = state.txs.get_mut(txid) {
            tx.height = Some(height);
        }
    }

    pub fn set_broadcast_error(&self, message: Option<&str>) {
        self.state.lock().broadcast_error = message.map(str::to_string);
    }

    pub fn broadcasts(&self) -> Vec<String> {
        self.state.lock().broadcasts.clone()
    }

    /// How many times `method` was called with `key` as first parameter.
    pub fn request_count(&self, method: &str, key: &str) -> usize {
        self.state
            .lock()
            .requests
            .iter()
            .filter(|(m, k)| m == method && k == key)
            .count()
    }

    /// Announce a new tip to every connected client.
    pub async fn push_header(&self, height: u64) {
        self.state.lock().tip = height;
        let params = json!([{ "height": height, "hex": "00" }]);
        self.push("blockchain.headers.subscribe", params).await;
    }

    /// Announce a script hash status change to every connected client.
    pub async fn push_scripthash(&self, script_hash_hex: &str, status: &str) {
        let params = json!([script_hash_hex, status]);
        self.push("blockchain.scripthash.subscribe", params).await;
    }

    async fn push(&self, method: &str, params: Value) {
        let mut frame = json!({"jsonrpc": "2.0", "method": method, "params": params}).to_string();
        frame.push('\n');
        let clients: Vec<_> = self.clients.lock().iter().cloned().collect();
        for client in clients {
            let _ = client.lock().await.write_all(frame.as_bytes()).await;
        }
    }
}

fn handle_request(
    state: &Arc<Mutex<ServerState>>,
    method: &str,
    params: &Value,
) -> Result<Value, Value> {
    let first_param = params[0].as_str().unwrap_or_default().to_string();
    let mut state = state.lock();
    state.requests.push((method.to_string(), first_param.clone()));
    match method {
        "server.version" => Ok(json!(["mock-electrum 1.0", "1.4"])),
        "server.ping" => Ok(Value::Null),
        "blockchain.headers.subscribe" => Ok(json!({ "height": state.tip, "hex": "00" })),
        "blockchain.scripthash.subscribe" => {
            let has_activity = state
                .history
                .get(&first_param)
                .map(|list| !list.is_empty())
                .unwrap_or(false)
                || state
                    .mempool
                    .get(&first_param)
                    .map(|list| !list.is_empty())
                    .unwrap_or(false);
            if has_activity {
                Ok(json!(hex::encode(Sha256::digest(first_param.as_bytes()))))
            } else {
                Ok(Value::Null)
            }
        }
        "blockchain.scripthash.get_history" => {
            let mut entries: Vec<Value> = Vec::new();
            if let Some(txids) = state.history.get(&first_param) {
                for txid in txids {
                    let height = state
                        .txs
                        .get(txid)
                        .and_then(|tx| tx.height)
                        .unwrap_or_default();
                    entries.push(json!({"tx_hash": txid, "height": height}));
                }
            }
            Ok(Value::Array(entries))
        }
        "blockchain.scripthash.get_mempool" => {
            let mut entries: Vec<Value> = Vec::new();
            if let Some(txids) = state.mempool.get(&first_param) {
                for txid in txids {
                    entries.push(json!({"tx_hash": txid, "height": 0}));
                }
            }
            Ok(Value::Array(entries))
        }
        "blockchain.scripthash.get_balance" => Ok(json!({"confirmed": 0, "unconfirmed": 0})),
        "blockchain.transaction.get" => {
            let Some(tx) = state.txs.get(&first_param) else {
                return Err(json!({"code": 2, "message": "missing transaction"}));
            };
            Ok(verbose_tx(state.tip, &first_param, tx))
        }
        "blockchain.transaction.broadcast" => {
            if let Some(message) = &state.broadcast_error {
                return Err(json!({"code": 1, "message": message}));
            }
            state.broadcasts.push(first_param.clone());
            let payload = hex::decode(&first_param).unwrap_or_default();
            Ok(json!(hex::encode(Sha256::digest(&payload))))
        }
        other => Err(json!({"code": -32601, "message": format!("unknown method {other}")})),
    }
}

fn verbose_tx(tip: u64, txid: &str, tx: &MockTx) -> Value {
    let confirmations = tx.height.map(|height| tip - height + 1).unwrap_or(0);
    let vin: Vec<Value> = tx
        .vin
        .iter()
        .map(|vin| match vin {
            MockVin::Coinbase => json!({"coinbase": "044c86041b"}),
            MockVin::Prev { txid, vout } => json!({"txid": txid, "vout": vout}),
        })
        .collect();
    let vout: Vec<Value> = tx
        .vout
        .iter()
        .enumerate()
        .map(|(n, (address, sats))| {
            let script = match address {
                Some(address) => json!({
                    "address": address,
                    "hex": "0014aa",
                    "type": "witness_v0_keyhash",
                }),
                None => json!({ "hex": "6a24", "type": "nulldata" }),
            };
            json!({
                "value": *sats as f64 / 1e8,
                "n": n as u32,
                "scriptPubKey": script,
            })
        })
        .collect();
    json!({
        "txid": txid,
        "hex": "00",
        "confirmations": confirmations,
        "vin": vin,
        "vout": vout,
    })
}

/// A wallet wired to a [`MockServer`] over real sockets.
pub struct TestWallet {
    pub server: MockServer,
    pub provider: Arc<Provider>,
    pub sync: Arc<SyncManager>,
    pub builder: TransactionBuilder,
    pub keys: Arc<SeedKeyManager>,
}

pub async fn test_wallet(server: MockServer, policy: PolicyConfig) -> TestWallet {
    let (events_tx, _events_rx) = events::channel();
    let connection = Connection::new(
        server.addr.ip().to_string(),
        server.addr.port(),
        Duration::from_secs(5),
        Duration::from_secs(5),
    );
    connection.connect().await.expect("connect");
    let cache_store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
    let cache =
        Arc::new(TxCache::new(cache_store, 10_000, Duration::from_secs(300)).expect("cache"));
    let provider = Arc::new(Provider::new(connection, cache, events_tx.clone()));
    let _pump = provider.spawn_event_pump();

    let keys = Arc::new(SeedKeyManager::new(TEST_SEED, Network::Regtest));
    let ledger = Arc::new(AddressLedger::new(mem(), mem(), mem()));
    let base_path = HdPath::new(84, 1, policy.account, Chain::External, 0);
    let sync = Arc::new(SyncManager::new(
        Arc::clone(&provider),
        Arc::clone(&keys) as Arc<dyn KeyManager>,
        ledger,
        mem(),
        mem(),
        &policy,
        base_path,
        events_tx,
    ));
    sync.init().expect("init");
    let builder = TransactionBuilder::new(Arc::clone(&sync), 546, 100_000);

    TestWallet {
        server,
        provider,
        sync,
        builder,
        keys,
    }
}

fn mem() -> Arc<dyn KvStore> {
    Arc::new(MemoryStore::new())
}

pub fn derived(keys: &SeedKeyManager, chain: Chain, index: u32) -> DerivedKey {
    keys.derive(&HdPath::new(84, 1, 0, chain, index))
        .expect("derive")
}

/// Script a confirmed payment of `sats` to `key` at `height`, funded by
/// a foreign transaction so fee math stays consistent.
pub fn fund_address(server: &MockServer, key: &DerivedKey, txid: &str, height: u64, sats: u64) {
    let foreign_txid = format!("f{txid}");
    server.add_tx(
        &foreign_txid,
        MockTx {
            height: Some(height.saturating_sub(5)),
            vin: vec![MockVin::Coinbase],
            vout: vec![(Some("bcrt1qforeign".to_string()), sats + 1_000)],
        },
    );
    server.add_tx(
        txid,
        MockTx {
            height: Some(height),
            vin: vec![MockVin::Prev {
                txid: foreign_txid,
                vout: 0,
            }],
            vout: vec![(Some(key.address.clone()), sats)],
        },
    );
    server.add_confirmed(&key.script_hash.to_hex(), txid);
}

/// Poll until `condition` holds or a generous deadline passes.
pub async fn wait_for<F: Fn() -> bool>(condition: F) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within deadline");
}
