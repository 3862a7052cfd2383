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

use std::convert::AsRef;
use std::ops::Add;

use bitcoin::{OutPoint, Script, Transaction, TxOut, Txid};

use serde::{Deserialize, Serialize};

/// Types of keychains
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeychainKind {
    /// External
    External = 0,
    /// Internal, usually used for change outputs
    Internal = 1,
}

impl AsRef<[u8]> for KeychainKind {
    fn as_ref(&self) -> &[u8] {
        match self {
            KeychainKind::External => b"e",
            KeychainKind::Internal => b"i",
        }
    }
}

/// Fee rate
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
// Internally stored as satoshi/kvbyte, so that every computation stays in integers
pub struct FeeRate(u64);

impl FeeRate {
    /// Create a new instance of [`FeeRate`] given a fee rate in satoshi/kvbyte
    pub const fn from_sat_per_kvb(sat_per_kvb: u64) -> Self {
        FeeRate(sat_per_kvb)
    }

    /// Create a new instance of [`FeeRate`] given a fee rate in satoshi/vbyte
    pub const fn from_sat_per_vb(sat_per_vb: u64) -> Self {
        FeeRate(sat_per_vb * 1_000)
    }

    /// Create a new [`FeeRate`] with the default min relay fee value
    pub const fn default_min_relay_fee() -> Self {
        FeeRate(1_000)
    }

    /// Return the value as satoshi/kvbyte
    pub fn as_sat_per_kvb(&self) -> u64 {
        self.0
    }

    /// Fee, rounded up to the next satoshi, to pay for `weight` weight units
    pub fn fee_wu(&self, weight: usize) -> u64 {
        let num = weight as u64 * self.0;
        (num + 3_999) / 4_000
    }

    /// Fee, rounded up to the next satoshi, to pay for `vbytes` virtual bytes
    pub fn fee_vb(&self, vbytes: usize) -> u64 {
        self.fee_wu(vbytes * 4)
    }
}

impl std::default::Default for FeeRate {
    fn default() -> Self {
        FeeRate::default_min_relay_fee()
    }
}

/// How the wallet came to track a destination
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestinationKind {
    /// Derived from one of the wallet's keychains
    Derived {
        /// Keychain the destination was derived from
        keychain: KeychainKind,
        /// Derivation index
        index: u32,
    },
    /// Imported script the wallet can watch but not sign for
    WatchOnly,
}

/// A destination (address) tracked by the wallet
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DestinationInfo {
    /// Origin of the destination
    pub kind: DestinationKind,
    /// Unix timestamp of when the wallet started tracking it
    pub created_at: u64,
}

impl DestinationInfo {
    /// Whether the wallet holds the keys for this destination
    pub fn is_watch_only(&self) -> bool {
        self.kind == DestinationKind::WatchOnly
    }

    /// Keychain of a derived destination, `None` for watch-only ones
    pub fn keychain(&self) -> Option<KeychainKind> {
        match self.kind {
            DestinationKind::Derived { keychain, .. } => Some(keychain),
            DestinationKind::WatchOnly => None,
        }
    }
}

/// A distinct transaction paying one or more outputs to a single destination
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FundingEvent {
    /// Funding transaction
    pub txid: Txid,
    /// Destination that was paid
    pub script_pubkey: Script,
    /// Indexes of the outputs paying the destination, sorted
    pub vouts: Vec<u32>,
    /// Confirmed in block height, `None` means unconfirmed
    pub height: Option<u32>,
    /// Whether the funding transaction was created by this wallet
    pub is_own: bool,
}

impl FundingEvent {
    /// Whether the funding transaction is confirmed
    pub fn is_confirmed(&self) -> bool {
        self.height.is_some()
    }

    /// Fold a replayed record of the same `(script_pubkey, txid)` pair into this one.
    ///
    /// The output set is the union of both records and the confirmation state is the one
    /// of the most recent record.
    pub fn merge(&mut self, other: FundingEvent) {
        debug_assert_eq!(self.txid, other.txid);
        debug_assert_eq!(self.script_pubkey, other.script_pubkey);

        self.vouts.extend(other.vouts);
        self.vouts.sort_unstable();
        self.vouts.dedup();

        self.height = other.height;
        self.is_own |= other.is_own;
    }
}

/// An unspent output owned (or watched) by a [`Wallet`].
///
/// Whether the output is *dirty* is deliberately not part of this struct: it depends on the
/// funding history of the destination and is derived on every query.
///
/// [`Wallet`]: crate::Wallet
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct LocalUtxo {
    /// Reference to a transaction output
    pub outpoint: OutPoint,
    /// Transaction output
    pub txout: TxOut,
    /// Type of keychain, `None` for watch-only outputs
    pub keychain: Option<KeychainKind>,
    /// Confirmed in block height, `None` means unconfirmed
    pub height: Option<u32>,
    /// Whether the output was created by a coinbase transaction
    pub is_coinbase: bool,
    /// Whether the output has been spent by a transaction the wallet knows about
    pub is_spent: bool,
}

impl LocalUtxo {
    /// Whether the wallet can't sign for this output
    pub fn is_watch_only(&self) -> bool {
        self.keychain.is_none()
    }
}

/// A [`LocalUtxo`] with its `satisfaction_weight`.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightedUtxo {
    /// The weight of the `scriptSig` and witness data expressed in weight units. This is used to
    /// properly maintain the feerate when adding this input to a transaction during coin selection.
    pub satisfaction_weight: usize,
    /// The UTXO
    pub utxo: LocalUtxo,
}

/// Whether, and how, an output can be spent right now
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Spendability {
    /// Confirmed, or unconfirmed but created by this wallet
    Spendable,
    /// Unconfirmed and paid by someone else
    Untrusted,
    /// Coinbase output that hasn't reached maturity
    Immature,
    /// The wallet doesn't hold the keys for it
    WatchOnly,
}

/// An unspent output together with the flags derived for it at query time
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ClassifiedUtxo {
    /// The output
    pub utxo: LocalUtxo,
    /// Current spendability
    pub spendability: Spendability,
    /// Whether the destination of the output has been funded more than once
    pub is_dirty: bool,
}

/// A wallet transaction
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct TransactionDetails {
    /// Optional transaction
    pub transaction: Option<Transaction>,
    /// Transaction id
    pub txid: Txid,
    /// Timestamp
    pub timestamp: u64,
    /// Received value (sats)
    pub received: u64,
    /// Sent value (sats)
    pub sent: u64,
    /// Fee value (sats), `None` if some inputs are not known to the wallet
    pub fees: Option<u64>,
    /// Confirmed in block height, `None` means unconfirmed
    pub height: Option<u32>,
}

/// Balance of the wallet, partitioned by spendability and by reuse.
///
/// All values are in satoshis.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Balance {
    /// Spendable value on destinations funded only once
    pub trusted: u64,
    /// Spendable value on reused destinations
    pub used: u64,
    /// Unconfirmed value received from other wallets
    pub untrusted_pending: u64,
    /// Coinbase value that hasn't reached maturity
    pub immature: u64,
    /// Value the wallet watches but can't spend
    pub watch_only: u64,
}

impl Balance {
    /// Value available to a default spend under the given policy
    pub fn spendable(&self, avoid_reuse: bool) -> u64 {
        match avoid_reuse {
            true => self.trusted,
            false => self.trusted + self.used,
        }
    }

    /// Everything owned by the wallet, watch-only excluded
    pub fn total(&self) -> u64 {
        self.trusted + self.used + self.untrusted_pending + self.immature
    }
}

impl Add for Balance {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Balance {
            trusted: self.trusted + other.trusted,
            used: self.used + other.used,
            untrusted_pending: self.untrusted_pending + other.untrusted_pending,
            immature: self.immature + other.immature,
            watch_only: self.watch_only + other.watch_only,
        }
    }
}
