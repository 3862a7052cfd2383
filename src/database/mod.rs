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

//! Database types
//!
//! This module provides the implementation of some defaults database types, along with traits that
//! can be implemented externally to let [`Wallet`]s use customized databases.
//!
//! The database is the wallet's durable history: the destinations it handed out, every funding
//! event seen for them, the outputs they produced and the transactions that moved them. The
//! reuse ledger is nothing more than the set of funding events stored here, so it survives a
//! restart together with the rest of the wallet state.
//!
//! It's important to note that the databases defined here only contains "blockchain-related" data.
//! They can be seen more as a cache than a critical piece of storage that contains secrets and
//! keys.
//!
//! [`Wallet`]: crate::wallet::Wallet

use bitcoin::hashes::hex::ToHex;
use bitcoin::{OutPoint, Script, Transaction, Txid};

use crate::error::Error;
use crate::types::*;

#[cfg(feature = "key-value-db")]
pub(crate) mod keyvalue;

pub mod memory;
pub use memory::MemoryDatabase;

/// Trait for operations that can be batched
///
/// This trait defines the list of operations that must be implemented on the [`Database`] type and
/// the [`BatchDatabase::Batch`] type.
pub trait BatchOperations {
    /// Store a destination, and its derivation path if it was derived from a keychain
    fn set_destination(&mut self, script: &Script, info: &DestinationInfo) -> Result<(), Error>;
    /// Store a [`LocalUtxo`]
    fn set_utxo(&mut self, utxo: &LocalUtxo) -> Result<(), Error>;
    /// Store a [`FundingEvent`], replacing any record for the same `(script_pubkey, txid)`
    fn set_funding(&mut self, event: &FundingEvent) -> Result<(), Error>;
    /// Store a raw transaction
    fn set_raw_tx(&mut self, transaction: &Transaction) -> Result<(), Error>;
    /// Store the metadata of a transaction
    fn set_tx(&mut self, transaction: &TransactionDetails) -> Result<(), Error>;
    /// Store the last derivation index for a given keychain
    fn set_last_index(&mut self, keychain: KeychainKind, value: u32) -> Result<(), Error>;
}

/// Trait for reading data from a database
///
/// This traits defines the operations that can be used to read data out of a database
pub trait Database: BatchOperations {
    /// Return the list of [`LocalUtxo`]s, spent ones included
    fn iter_utxos(&self) -> Result<Vec<LocalUtxo>, Error>;
    /// Return the funding events of a destination, or of every destination if `script` is `None`
    fn iter_funding(&self, script: Option<&Script>) -> Result<Vec<FundingEvent>, Error>;
    /// Return the list of transactions metadata
    fn iter_txs(&self, include_raw: bool) -> Result<Vec<TransactionDetails>, Error>;

    /// Fetch a destination
    fn get_destination(&self, script: &Script) -> Result<Option<DestinationInfo>, Error>;
    /// Fetch a [`LocalUtxo`] given its [`OutPoint`]
    fn get_utxo(&self, outpoint: &OutPoint) -> Result<Option<LocalUtxo>, Error>;
    /// Fetch the funding event of a destination for a given transaction
    fn get_funding(&self, script: &Script, txid: &Txid) -> Result<Option<FundingEvent>, Error>;
    /// Fetch a raw transaction given its [`Txid`]
    fn get_raw_tx(&self, txid: &Txid) -> Result<Option<Transaction>, Error>;
    /// Fetch the transaction metadata and optionally also the raw transaction
    fn get_tx(&self, txid: &Txid, include_raw: bool) -> Result<Option<TransactionDetails>, Error>;
    /// Return the last defivation index for a keychain.
    fn get_last_index(&self, keychain: KeychainKind) -> Result<Option<u32>, Error>;

    /// Increment the last derivation index for a keychain and return it
    ///
    /// It should insert and return `0` if not present in the database
    fn increment_last_index(&mut self, keychain: KeychainKind) -> Result<u32, Error>;
}

/// Trait for a database that supports batch operations
///
/// This trait defines the methods to start and apply a batch of operations.
pub trait BatchDatabase: Database {
    /// Container for the operations
    type Batch: BatchOperations;

    /// Create a new batch container
    fn begin_batch(&self) -> Self::Batch;
    /// Consume and apply a batch of operations
    fn commit_batch(&mut self, batch: Self::Batch) -> Result<(), Error>;
}

pub(crate) trait DatabaseUtils: Database {
    fn is_mine(&self, script: &Script) -> Result<bool, Error> {
        self.get_destination(script)
            .map(|o| o.map_or(false, |info| !info.is_watch_only()))
    }

    fn is_tracked(&self, script: &Script) -> Result<bool, Error> {
        self.get_destination(script).map(|o| o.is_some())
    }

    /// Combine `event` with the record already stored for the same pair, if any. The result is
    /// what must be written back so that replays never add a new event.
    fn merged_funding(&self, event: FundingEvent) -> Result<FundingEvent, Error> {
        match self.get_funding(&event.script_pubkey, &event.txid)? {
            Some(mut stored) => {
                if stored.is_confirmed() && !event.is_confirmed() {
                    log::warn!(
                        "Funding of {} by {} moved back to unconfirmed",
                        event.script_pubkey.as_bytes().to_hex(),
                        event.txid
                    );
                }

                stored.merge(event);
                Ok(stored)
            }
            None => Ok(event),
        }
    }

    fn record_funding(&mut self, event: FundingEvent) -> Result<(), Error> {
        let merged = self.merged_funding(event)?;
        self.set_funding(&merged)
    }
}

impl<T: Database> DatabaseUtils for T {}
