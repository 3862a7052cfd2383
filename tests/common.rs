#![allow(unused)]
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use avoidreuse::bitcoin::secp256k1::Secp256k1;
use avoidreuse::bitcoin::util::bip32::{ExtendedPrivKey, ExtendedPubKey};
use avoidreuse::bitcoin::{Address, Network, OutPoint, Script, Transaction, TxIn, TxOut};
use avoidreuse::blockchain::Blockchain;
use avoidreuse::database::{BatchDatabase, MemoryDatabase};
use avoidreuse::rpc::{self, RpcError};
use avoidreuse::{Error, Wallet, WalletConfig};

use log::debug;
use serde_json::Value;

pub const BLOCK_REWARD: u64 = 50 * 100_000_000;

/// An in-process chain: broadcast transactions wait in the mempool until the next block
#[derive(Debug, Default)]
pub struct TestChain {
    mempool: Mutex<Vec<Transaction>>,
    blocks: Mutex<Vec<Vec<Transaction>>>,
}

impl TestChain {
    pub fn new() -> Arc<Self> {
        let _ = env_logger::try_init();

        Arc::new(TestChain::default())
    }

    pub fn height(&self) -> u32 {
        self.blocks.lock().unwrap().len() as u32
    }

    /// Mine `num_blocks` blocks paying their reward to `address`, the first one confirms the
    /// whole mempool
    pub fn generate(&self, num_blocks: u32, address: &Address) {
        let mut blocks = self.blocks.lock().unwrap();
        let mut mempool = self.mempool.lock().unwrap();

        for _ in 0..num_blocks {
            let height = blocks.len() as u32 + 1;
            let coinbase = Transaction {
                version: 1,
                lock_time: 0,
                input: vec![TxIn {
                    previous_output: OutPoint::null(),
                    script_sig: Script::from(height.to_le_bytes().to_vec()),
                    sequence: 0xFFFF_FFFF,
                    witness: vec![],
                }],
                output: vec![TxOut {
                    value: BLOCK_REWARD,
                    script_pubkey: address.script_pubkey(),
                }],
            };

            let mut block = vec![coinbase];
            block.append(&mut mempool);
            blocks.push(block);
        }

        debug!("Generated blocks to new height {}", blocks.len());
    }

    /// Feed every block and the mempool to `wallet`
    pub fn sync<B: Blockchain, D: BatchDatabase>(&self, wallet: &Wallet<B, D>) {
        let blocks = self.blocks.lock().unwrap();
        for (index, block) in blocks.iter().enumerate() {
            for tx in block {
                wallet
                    .apply_transaction(tx, Some(index as u32 + 1))
                    .unwrap();
            }
        }
        for tx in self.mempool.lock().unwrap().iter() {
            wallet.apply_transaction(tx, None).unwrap();
        }

        wallet.set_current_height(blocks.len() as u32).unwrap();
    }
}

/// Client that relays transactions to a [`TestChain`]
#[derive(Debug, Clone)]
pub struct ChainClient(pub Arc<TestChain>);

impl Blockchain for ChainClient {
    fn is_online(&self) -> bool {
        true
    }

    fn offline() -> Self {
        ChainClient(Arc::new(TestChain::default()))
    }

    fn broadcast(&self, tx: &Transaction) -> Result<(), Error> {
        debug!("Broadcasting {}", tx.txid());
        self.0.mempool.lock().unwrap().push(tx.clone());

        Ok(())
    }
}

pub type TestWallet = Wallet<ChainClient, MemoryDatabase>;

pub fn test_xpub(seed: u8) -> ExtendedPubKey {
    let secp = Secp256k1::new();
    let xprv = ExtendedPrivKey::new_master(Network::Regtest, &[seed; 32]).unwrap();

    ExtendedPubKey::from_private(&secp, &xprv)
}

pub fn get_test_node(chain: &Arc<TestChain>, seed: u8, avoid_reuse: bool) -> TestWallet {
    let config = WalletConfig {
        avoid_reuse,
        ..Default::default()
    };

    Wallet::new(
        test_xpub(seed),
        None,
        config,
        MemoryDatabase::new(),
        ChainClient(Arc::clone(chain)),
    )
    .unwrap()
}

/// Call `method` on `wallet` through the RPC dispatcher
pub fn call<B: Blockchain, D: BatchDatabase>(
    wallet: &Wallet<B, D>,
    method: &str,
    params: Value,
) -> Result<Value, RpcError> {
    rpc::dispatch(wallet, method, &params)
}

pub fn new_address<B: Blockchain, D: BatchDatabase>(wallet: &Wallet<B, D>) -> Address {
    let address = call(wallet, "getnewaddress", Value::Null).unwrap();

    Address::from_str(address.as_str().unwrap()).unwrap()
}

/// Mine `num_blocks` blocks, each paying a fresh address of `wallet`
pub fn mine<B: Blockchain, D: BatchDatabase>(chain: &TestChain, wallet: &Wallet<B, D>, num_blocks: u32) {
    for _ in 0..num_blocks {
        chain.generate(1, &new_address(wallet));
    }
}

pub fn as_sat(value: &Value) -> u64 {
    rpc::parse_amount(&Value::String(format!("{:.8}", value.as_f64().unwrap()))).unwrap()
}
