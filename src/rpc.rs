// Magical Bitcoin Library
// Written in 2020 by
//     Alekos Filini <alekos.filini@gmail.com>
//
// Copyright (c) 2020 Magical Bitcoin
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.

//! JSON-RPC method dispatch
//!
//! This module maps the wallet operations to the JSON-RPC methods a node exposes, without any
//! transport: [`dispatch`] takes an already decoded method name and its params, while
//! [`handle_request`] works on a raw request string and returns the encoded response.
//!
//! Amounts cross this boundary as decimal bitcoin values and are converted to satoshi with
//! [`parse_amount`] and back with [`format_amount`]. Inputs with more than 8 decimal places are
//! rejected instead of being rounded.
//!
//! ## Example
//!
//! ```
//! # use avoidreuse::bitcoin::util::bip32::{ExtendedPrivKey, ExtendedPubKey};
//! # use avoidreuse::bitcoin::secp256k1::Secp256k1;
//! # use avoidreuse::bitcoin::Network;
//! # use avoidreuse::database::MemoryDatabase;
//! # use avoidreuse::{OfflineWallet, Wallet, WalletConfig};
//! # let secp = Secp256k1::new();
//! # let xprv = ExtendedPrivKey::new_master(Network::Regtest, &[0x42; 32])?;
//! # let xpub = ExtendedPubKey::from_private(&secp, &xprv);
//! # let wallet: OfflineWallet<_> =
//! #     Wallet::new_offline(xpub, None, WalletConfig::default(), MemoryDatabase::new())?;
//! use avoidreuse::rpc;
//!
//! let response = rpc::handle_request(&wallet, r#"{"method": "getbalance", "params": [], "id": 1}"#);
//! assert_eq!(response, r#"{"error":null,"id":1,"result":0.0}"#);
//! # Ok::<(), avoidreuse::Error>(())
//! ```

use std::fmt;
use std::str::FromStr;

use bitcoin::hashes::hex::ToHex;
use bitcoin::util::amount::{Amount, Denomination};
use bitcoin::Address;

use serde::Serialize;
use serde_json::{Map, Value};

#[allow(unused_imports)]
use log::{debug, error, info, trace};

use crate::blockchain::Blockchain;
use crate::database::BatchDatabase;
use crate::error::Error;
use crate::wallet::utils::confirmations;
use crate::wallet::Wallet;

/// Wallet error, such as insufficient funds
pub const RPC_WALLET_ERROR: i32 = -4;
/// Invalid, missing or unknown address
pub const RPC_INVALID_ADDRESS_OR_KEY: i32 = -5;
/// Unexpected type or value, such as an invalid amount
pub const RPC_TYPE_ERROR: i32 = -3;
/// Any other engine error
pub const RPC_MISC_ERROR: i32 = -1;
/// The method doesn't exist
pub const RPC_METHOD_NOT_FOUND: i32 = -32601;
/// Invalid method parameters
pub const RPC_INVALID_PARAMS: i32 = -32602;
/// The request is not a valid request object
pub const RPC_INVALID_REQUEST: i32 = -32600;
/// The request is not valid JSON
pub const RPC_PARSE_ERROR: i32 = -32700;

const SATOSHI_PER_BTC: u64 = 100_000_000;
/// Largest amount accepted from a caller, 21 million bitcoin
pub const MAX_MONEY: u64 = 21_000_000 * SATOSHI_PER_BTC;

/// Error returned to the RPC caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RpcError {
    /// Numeric error code
    pub code: i32,
    /// Human readable message
    pub message: String,
}

impl RpcError {
    /// Create a new error
    pub fn new<S: Into<String>>(code: i32, message: S) -> Self {
        RpcError {
            code,
            message: message.into(),
        }
    }

    fn invalid_params<S: Into<String>>(message: S) -> Self {
        RpcError::new(RPC_INVALID_PARAMS, message)
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

impl std::error::Error for RpcError {}

impl From<Error> for RpcError {
    fn from(err: Error) -> Self {
        match err {
            Error::InsufficientFunds { .. } => {
                debug!("Send request rejected: {}", err);
                RpcError::new(RPC_WALLET_ERROR, "Insufficient funds")
            }
            Error::UnknownDestination(_) | Error::InvalidAddressNetwork(_) => {
                RpcError::new(RPC_INVALID_ADDRESS_OR_KEY, err.to_string())
            }
            Error::OutputBelowDustLimit(_) => {
                RpcError::new(RPC_TYPE_ERROR, "Transaction amount too small")
            }
            Error::Amount(_) => RpcError::new(RPC_TYPE_ERROR, err.to_string()),
            err => RpcError::new(RPC_MISC_ERROR, err.to_string()),
        }
    }
}

/// Parse a decimal bitcoin amount, given as a JSON number or string, into satoshi
pub fn parse_amount(value: &Value) -> Result<u64, RpcError> {
    let amount = match value {
        Value::Number(n) => match n.as_u64() {
            Some(btc) => btc
                .checked_mul(SATOSHI_PER_BTC)
                .map(Amount::from_sat)
                .ok_or_else(|| RpcError::new(RPC_TYPE_ERROR, "Amount out of range"))?,
            // `f64`'s `Display` never uses an exponent, which `from_btc` relies on
            None => n
                .as_f64()
                .ok_or_else(|| RpcError::new(RPC_TYPE_ERROR, "Invalid amount"))
                .and_then(|btc| Amount::from_btc(btc).map_err(|e| Error::from(e).into()))?,
        },
        Value::String(s) => {
            Amount::from_str_in(s, Denomination::Bitcoin).map_err(Error::from)?
        }
        _ => return Err(RpcError::new(RPC_TYPE_ERROR, "Amount is not a number or string")),
    };

    match amount.as_sat() {
        sat if sat > MAX_MONEY => Err(RpcError::new(RPC_TYPE_ERROR, "Amount out of range")),
        sat => Ok(sat),
    }
}

/// Format a satoshi amount as a decimal bitcoin value
pub fn format_amount(sat: u64) -> Value {
    json!(Amount::from_sat(sat).as_btc())
}

// Positional (array) or named (object) params
struct Params<'a>(&'a Value);

impl<'a> Params<'a> {
    fn new(params: &'a Value) -> Result<Self, RpcError> {
        match params {
            Value::Null | Value::Array(_) | Value::Object(_) => Ok(Params(params)),
            _ => Err(RpcError::invalid_params("Params must be an array or an object")),
        }
    }

    fn get(&self, index: usize, name: &str) -> Option<&'a Value> {
        let value = match self.0 {
            Value::Array(values) => values.get(index),
            Value::Object(values) => values.get(name),
            _ => None,
        };

        value.filter(|v| !v.is_null())
    }

    fn required(&self, index: usize, name: &str) -> Result<&'a Value, RpcError> {
        self.get(index, name)
            .ok_or_else(|| RpcError::invalid_params(format!("Missing `{}`", name)))
    }

    fn bool_or(&self, index: usize, name: &str, default: bool) -> Result<bool, RpcError> {
        match self.get(index, name) {
            None => Ok(default),
            Some(Value::Bool(b)) => Ok(*b),
            Some(_) => Err(RpcError::new(
                RPC_TYPE_ERROR,
                format!("`{}` must be a boolean", name),
            )),
        }
    }

    fn address(&self, index: usize, name: &str) -> Result<Address, RpcError> {
        self.required(index, name)?
            .as_str()
            .and_then(|s| Address::from_str(s).ok())
            .ok_or_else(|| RpcError::new(RPC_INVALID_ADDRESS_OR_KEY, "Invalid address"))
    }
}

/// Execute `method` on `wallet`
pub fn dispatch<B, D>(wallet: &Wallet<B, D>, method: &str, params: &Value) -> Result<Value, RpcError>
where
    B: Blockchain,
    D: BatchDatabase,
{
    debug!("RPC call `{}` with params {}", method, params);

    let params = Params::new(params)?;
    let network = wallet.config().network;

    match method {
        "getbalance" => {
            // the flag only matters on wallets running the policy
            let avoid_reuse = params.bool_or(3, "avoid_reuse", true)?;
            let balances = wallet.get_balances()?;

            Ok(format_amount(
                balances.spendable(wallet.config().avoid_reuse && avoid_reuse),
            ))
        }
        "getbalances" => {
            let balances = wallet.get_balances()?;

            let mut mine = Map::new();
            if wallet.config().avoid_reuse {
                mine.insert("trusted".into(), format_amount(balances.trusted));
                mine.insert("used".into(), format_amount(balances.used));
            } else {
                mine.insert(
                    "trusted".into(),
                    format_amount(balances.trusted + balances.used),
                );
            }
            mine.insert(
                "untrusted_pending".into(),
                format_amount(balances.untrusted_pending),
            );
            mine.insert("immature".into(), format_amount(balances.immature));

            Ok(json!({
                "mine": mine,
                "watchonly": {
                    "trusted": format_amount(balances.watch_only),
                },
            }))
        }
        "getnewaddress" => Ok(json!(wallet.get_new_address()?.to_string())),
        "getaddressinfo" => {
            let address = params.address(0, "address")?;
            let info = wallet.get_address_info(&address)?;

            Ok(json!({
                "address": address.to_string(),
                "scriptPubKey": info.script_pubkey.as_bytes().to_hex(),
                "ismine": info.is_mine,
                "iswatchonly": info.is_watch_only,
                "ischange": info.is_change,
                "index": info.index,
                "timestamp": info.created_at,
                "reuse_count": info.reuse_count,
                "used": info.is_dirty,
            }))
        }
        "importaddress" => {
            let address = params.address(0, "address")?;
            wallet.import_watch_only(&address)?;

            Ok(Value::Null)
        }
        "listunspent" => {
            let current_height = wallet.current_height()?;
            let unspent = wallet
                .list_unspent_classified()?
                .into_iter()
                .map(|c| {
                    let script_pubkey = &c.utxo.txout.script_pubkey;
                    json!({
                        "txid": c.utxo.outpoint.txid.to_string(),
                        "vout": c.utxo.outpoint.vout,
                        "address": Address::from_script(script_pubkey, network).map(|a| a.to_string()),
                        "scriptPubKey": script_pubkey.as_bytes().to_hex(),
                        "amount": format_amount(c.utxo.txout.value),
                        "confirmations": confirmations(c.utxo.height, current_height),
                        "spendable": !c.utxo.is_watch_only(),
                        "safe": c.spendability == crate::types::Spendability::Spendable,
                        "reused": c.is_dirty,
                    })
                })
                .collect();

            Ok(Value::Array(unspent))
        }
        "listtransactions" => {
            let current_height = wallet.current_height()?;
            let mut transactions = wallet.list_transactions(false)?;
            transactions.sort_by_key(|t| (t.height.unwrap_or(u32::MAX), t.timestamp));

            Ok(Value::Array(
                transactions
                    .into_iter()
                    .map(|t| {
                        json!({
                            "txid": t.txid.to_string(),
                            "received": format_amount(t.received),
                            "sent": format_amount(t.sent),
                            "fee": t.fees.map(format_amount),
                            "confirmations": confirmations(t.height, current_height),
                            "blockheight": t.height,
                            "time": t.timestamp,
                        })
                    })
                    .collect(),
            ))
        }
        "sendtoaddress" => {
            let address = params.address(0, "address")?;
            let amount = parse_amount(params.required(1, "amount")?)?;
            if amount == 0 {
                return Err(RpcError::new(RPC_TYPE_ERROR, "Invalid amount for send"));
            }
            let allow_dirty = params.bool_or(2, "allowdirty", false)?;

            let txid = wallet.send_to_address(&address, amount, allow_dirty)?;

            Ok(json!(txid.to_string()))
        }
        _ => Err(RpcError::new(
            RPC_METHOD_NOT_FOUND,
            format!("Method not found: {}", method),
        )),
    }
}

/// Handle a raw JSON-RPC request and return the encoded response
///
/// The response carries both `result` and `error`, one of them `null`, and echoes the `id` of
/// the request.
pub fn handle_request<B, D>(wallet: &Wallet<B, D>, request: &str) -> String
where
    B: Blockchain,
    D: BatchDatabase,
{
    let (id, outcome) = match serde_json::from_str::<Value>(request) {
        Err(e) => (
            Value::Null,
            Err(RpcError::new(RPC_PARSE_ERROR, e.to_string())),
        ),
        Ok(request) => {
            let id = request.get("id").cloned().unwrap_or(Value::Null);
            let outcome = match request.get("method").and_then(Value::as_str) {
                Some(method) => dispatch(
                    wallet,
                    method,
                    request.get("params").unwrap_or(&Value::Null),
                ),
                None => Err(RpcError::new(RPC_INVALID_REQUEST, "Missing method")),
            };

            (id, outcome)
        }
    };

    let response = match outcome {
        Ok(result) => json!({ "result": result, "error": Value::Null, "id": id }),
        Err(err) => {
            info!("RPC error: {}", err);
            json!({ "result": Value::Null, "error": err, "id": id })
        }
    };

    response.to_string()
}
