//! In-memory, scriptable facade implementations for the unit tests.

use std::{
    collections::HashMap,
    sync::{mpsc, Mutex},
};

use sha2::{Digest, Sha256};

use payrail::{
    activity::NetworkType,
    capability::{CapabilityError, CoinCapabilities, SerializedTx},
    fee::{FeeError, FeeLevel, FeeOracle, FeeRate},
    planner::{PlanOutline, UtxoInfo},
};

use crate::{
    config::{CoinConfig, LedgerCoinConfig, UtxoCoinConfig},
    ledger::{
        AccountInfo, AssetChange, LedgerEndpoint, LedgerError, LedgerHeader, LedgerNode, LedgerTx,
        ServerInfo, TxQueryOptions,
    },
    utxo::{AddressDetails, NodeError, TxDetail, UtxoNode},
};

/// A capability record whose addresses are "anything starting with the
/// prefix", and whose serializer hex-encodes the canonical JSON outline and
/// hashes it with SHA-256.
pub fn dummy_capabilities(prefix: &'static str) -> CoinCapabilities {
    CoinCapabilities::new(
        Box::new(move |address: &str| address.starts_with(prefix)),
        Box::new(move |index| Ok(format!("{}account{}", prefix, index))),
        Box::new(|outline: &PlanOutline| {
            let json = serde_json::to_vec(outline)
                .map_err(|e| CapabilityError::Serialization(e.to_string()))?;
            Ok(SerializedTx {
                hex: hex::encode(&json),
                hash: hex::encode(Sha256::digest(&json)),
            })
        }),
    )
}

/// A fee oracle handing back the same rate for every level.
pub struct FixedFeeOracle {
    rate: FeeRate,
}

impl FixedFeeOracle {
    pub fn new(rate: FeeRate) -> FixedFeeOracle {
        FixedFeeOracle { rate }
    }

    pub fn per_weight(rate: &str) -> FixedFeeOracle {
        FixedFeeOracle::new(FeeRate::per_weight(rate))
    }
}

impl FeeOracle for FixedFeeOracle {
    fn estimate(&self, _level: FeeLevel) -> Result<FeeRate, FeeError> {
        Ok(self.rate.clone())
    }
}

pub fn utxo_coin_config() -> UtxoCoinConfig {
    UtxoCoinConfig {
        coin: CoinConfig {
            asset_symbol: "BTC".to_string(),
            network_type: NetworkType::Mainnet,
            decimals: 8,
        },
        network_min_relay_fee: 1_000,
        dust_threshold: 546,
        target_utxo_pool_size: 1,
        min_change: "0".to_string(),
        use_unconfirmed_utxos: false,
        min_tx_fee: None,
    }
}

pub fn ledger_coin_config() -> LedgerCoinConfig {
    LedgerCoinConfig {
        coin: CoinConfig {
            asset_symbol: "XRP".to_string(),
            network_type: NetworkType::Mainnet,
            decimals: 6,
        },
        activity_page_size: 10,
        reconnect_attempts: 5,
        // Keep test runs fast.
        reconnect_delay_ms: 1,
        reconnect_max_delay_ms: 4,
    }
}

/// A successful payment of `amount_main` of the native asset from `from` to
/// `to`, with the matching signed balance changes on both sides.
pub fn payment_tx(
    id: &str,
    ledger_version: u64,
    index_in_ledger: u32,
    from: &str,
    to: &str,
    amount_main: &str,
) -> LedgerTx {
    let mut balance_changes = HashMap::new();
    balance_changes.insert(
        from.to_string(),
        vec![AssetChange {
            symbol: "XRP".to_string(),
            amount_main: format!("-{}", amount_main),
        }],
    );
    balance_changes.insert(
        to.to_string(),
        vec![AssetChange {
            symbol: "XRP".to_string(),
            amount_main: amount_main.to_string(),
        }],
    );
    LedgerTx {
        id: id.to_string(),
        tx_type: "payment".to_string(),
        successful: true,
        source: LedgerEndpoint {
            address: from.to_string(),
            tag: None,
        },
        destination: LedgerEndpoint {
            address: to.to_string(),
            tag: None,
        },
        ledger_version,
        index_in_ledger,
        balance_changes,
        timestamp_secs: 946_684_800 + ledger_version as i64,
    }
}

#[derive(Default)]
struct UtxoNodeState {
    addresses: HashMap<String, AddressDetails>,
    utxos: HashMap<String, Vec<UtxoInfo>>,
    txs: HashMap<String, TxDetail>,
    send_failure: Option<NodeError>,
    sent: Vec<String>,
}

pub struct DummyUtxoNode {
    state: Mutex<UtxoNodeState>,
}

impl DummyUtxoNode {
    pub fn new() -> DummyUtxoNode {
        DummyUtxoNode {
            state: Mutex::new(Default::default()),
        }
    }

    pub fn set_address(&self, address: &str, balance: &str, unconfirmed_balance: &str) {
        self.state.lock().unwrap().addresses.insert(
            address.to_string(),
            AddressDetails {
                balance: balance.to_string(),
                unconfirmed_balance: unconfirmed_balance.to_string(),
            },
        );
    }

    pub fn set_utxos(&self, address: &str, utxos: Vec<UtxoInfo>) {
        self.state
            .lock()
            .unwrap()
            .utxos
            .insert(address.to_string(), utxos);
    }

    pub fn insert_tx(&self, tx: TxDetail) {
        self.state.lock().unwrap().txs.insert(tx.txid.clone(), tx);
    }

    pub fn fail_next_send(&self, error: NodeError) {
        self.state.lock().unwrap().send_failure = Some(error);
    }

    pub fn sent(&self) -> Vec<String> {
        self.state.lock().unwrap().sent.clone()
    }
}

impl UtxoNode for DummyUtxoNode {
    fn get_address_details(&self, address: &str) -> Result<AddressDetails, NodeError> {
        self.state
            .lock()
            .unwrap()
            .addresses
            .get(address)
            .cloned()
            .ok_or_else(|| NodeError::NotFound(format!("address '{}'", address)))
    }

    fn get_utxos(&self, address: &str) -> Result<Vec<UtxoInfo>, NodeError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .utxos
            .get(address)
            .cloned()
            .unwrap_or_default())
    }

    fn get_tx(&self, txid: &str) -> Result<TxDetail, NodeError> {
        self.state
            .lock()
            .unwrap()
            .txs
            .get(txid)
            .cloned()
            .ok_or_else(|| NodeError::NotFound(format!("transaction '{}'", txid)))
    }

    fn send_tx(&self, raw_hex: &str) -> Result<String, NodeError> {
        let mut state = self.state.lock().unwrap();
        if let Some(error) = state.send_failure.take() {
            return Err(error);
        }
        let id = format!("node-txid-{}", state.sent.len());
        state.sent.push(raw_hex.to_string());
        Ok(id)
    }
}

struct LedgerNodeState {
    connected: bool,
    connect_count: u32,
    fail_reads: u32,
    complete_ledgers: String,
    txs: Vec<LedgerTx>,
    accounts: HashMap<String, AccountInfo>,
    responses: HashMap<String, serde_json::Value>,
    request_failures: HashMap<String, LedgerError>,
    subscriptions: Vec<String>,
    subscribe_failure: Option<LedgerError>,
}

pub struct DummyLedgerNode {
    state: Mutex<LedgerNodeState>,
    events: Option<mpsc::Receiver<LedgerTx>>,
}

impl DummyLedgerNode {
    /// A connected dummy server retaining the given "min-max" ledger range.
    /// The returned sender pushes live transaction events.
    pub fn new(complete_ledgers: &str) -> (DummyLedgerNode, mpsc::Sender<LedgerTx>) {
        let (sender, receiver) = mpsc::channel();
        let node = DummyLedgerNode {
            state: Mutex::new(LedgerNodeState {
                connected: true,
                connect_count: 0,
                fail_reads: 0,
                complete_ledgers: complete_ledgers.to_string(),
                txs: Vec::new(),
                accounts: HashMap::new(),
                responses: HashMap::new(),
                request_failures: HashMap::new(),
                subscriptions: Vec::new(),
                subscribe_failure: None,
            }),
            events: Some(receiver),
        };
        (node, sender)
    }

    pub fn push_tx(&self, tx: LedgerTx) {
        let mut state = self.state.lock().unwrap();
        state.txs.push(tx);
        state
            .txs
            .sort_by_key(|tx| (tx.ledger_version, tx.index_in_ledger));
    }

    pub fn set_account(&self, address: &str, activated: bool, balance_main: &str, sequence: u64) {
        self.state.lock().unwrap().accounts.insert(
            address.to_string(),
            AccountInfo {
                activated,
                balance_main: balance_main.to_string(),
                sequence,
            },
        );
    }

    pub fn set_response(&self, method: &str, value: serde_json::Value) {
        self.state
            .lock()
            .unwrap()
            .responses
            .insert(method.to_string(), value);
    }

    /// Make the next call to this request method fail.
    pub fn fail_request(&self, method: &str, error: LedgerError) {
        self.state
            .lock()
            .unwrap()
            .request_failures
            .insert(method.to_string(), error);
    }

    /// Make the next `count` reads fail with a transport disconnection,
    /// dropping the connection each time.
    pub fn fail_reads(&self, count: u32) {
        self.state.lock().unwrap().fail_reads = count;
    }

    pub fn reject_subscriptions(&self, error: LedgerError) {
        self.state.lock().unwrap().subscribe_failure = Some(error);
    }

    pub fn disconnect_now(&self) {
        self.state.lock().unwrap().connected = false;
    }

    pub fn connect_count(&self) -> u32 {
        self.state.lock().unwrap().connect_count
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.state.lock().unwrap().subscriptions.clone()
    }

    fn read_gate(state: &mut LedgerNodeState) -> Result<(), LedgerError> {
        if state.fail_reads > 0 {
            state.fail_reads -= 1;
            state.connected = false;
            return Err(LedgerError::TransportDisconnected(
                "socket closed".to_string(),
            ));
        }
        if !state.connected {
            return Err(LedgerError::NotConnected);
        }
        Ok(())
    }
}

impl LedgerNode for DummyLedgerNode {
    fn is_connected(&self) -> bool {
        self.state.lock().unwrap().connected
    }

    fn connect(&mut self) -> Result<(), LedgerError> {
        let mut state = self.state.lock().unwrap();
        state.connected = true;
        state.connect_count += 1;
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), LedgerError> {
        self.state.lock().unwrap().connected = false;
        Ok(())
    }

    fn request(
        &self,
        method: &str,
        _params: serde_json::Value,
    ) -> Result<serde_json::Value, LedgerError> {
        let mut state = self.state.lock().unwrap();
        Self::read_gate(&mut state)?;
        if let Some(error) = state.request_failures.remove(method) {
            return Err(error);
        }
        state
            .responses
            .get(method)
            .cloned()
            .ok_or_else(|| LedgerError::Server(format!("no canned response for '{}'", method)))
    }

    fn get_server_info(&self) -> Result<ServerInfo, LedgerError> {
        let mut state = self.state.lock().unwrap();
        Self::read_gate(&mut state)?;
        Ok(ServerInfo {
            complete_ledgers: state.complete_ledgers.clone(),
        })
    }

    fn get_account_info(&self, address: &str) -> Result<AccountInfo, LedgerError> {
        let mut state = self.state.lock().unwrap();
        Self::read_gate(&mut state)?;
        Ok(state.accounts.get(address).cloned().unwrap_or(AccountInfo {
            activated: false,
            balance_main: "0".to_string(),
            sequence: 0,
        }))
    }

    fn get_transactions(
        &self,
        address: &str,
        options: &TxQueryOptions,
    ) -> Result<Vec<LedgerTx>, LedgerError> {
        let mut state = self.state.lock().unwrap();
        Self::read_gate(&mut state)?;
        let involved: Vec<LedgerTx> = state
            .txs
            .iter()
            .filter(|tx| tx.source.address == address || tx.destination.address == address)
            .filter(|tx| !options.exclude_failures || tx.successful)
            .filter(|tx| {
                options
                    .min_ledger_version
                    .map_or(true, |min| tx.ledger_version >= min)
            })
            .filter(|tx| {
                options
                    .max_ledger_version
                    .map_or(true, |max| tx.ledger_version <= max)
            })
            .cloned()
            .collect();
        // Cursor pages start at the cursor transaction itself, as a real
        // server resuming from `startTx` does.
        let start = match &options.start_tx_id {
            Some(id) => involved.iter().position(|tx| &tx.id == id).unwrap_or(0),
            None => 0,
        };
        Ok(involved
            .into_iter()
            .skip(start)
            .take(options.limit as usize)
            .collect())
    }

    fn get_ledger(&self, ledger_version: u64) -> Result<LedgerHeader, LedgerError> {
        let mut state = self.state.lock().unwrap();
        Self::read_gate(&mut state)?;
        Ok(LedgerHeader {
            ledger_version,
            ledger_hash: format!("LH{:012}", ledger_version),
            close_time_secs: 946_684_800 + ledger_version as i64,
        })
    }

    fn subscribe(&mut self, addresses: &[String]) -> Result<(), LedgerError> {
        let mut state = self.state.lock().unwrap();
        if let Some(error) = state.subscribe_failure.take() {
            return Err(error);
        }
        state.subscriptions.extend(addresses.iter().cloned());
        Ok(())
    }

    fn take_events(&mut self) -> Option<mpsc::Receiver<LedgerTx>> {
        self.events.take()
    }
}
