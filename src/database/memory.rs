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

//! In-memory ephemeral database
//!
//! This module defines an in-memory database type called [`MemoryDatabase`] that is based on a
//! [`BTreeMap`].

use std::collections::BTreeMap;
use std::convert::TryInto;

use bitcoin::consensus::encode::{deserialize, serialize};
use bitcoin::{OutPoint, Script, Transaction, Txid};

use crate::database::{BatchDatabase, BatchOperations, Database};
use crate::error::Error;
use crate::types::*;

// script -> info       s<script> -> {kind, created_at}
// outpoint             u<outpoint> -> utxo
// funding              f<script><txid> -> event
// raw txs              r<txid> -> tx
// transactions         t<txid> -> tx details
// deriv indexes        c{i,e} -> u32

pub(crate) enum MapKey<'a> {
    Destination(Option<&'a Script>),
    Utxo(Option<&'a OutPoint>),
    Funding((Option<&'a Script>, Option<&'a Txid>)),
    RawTx(Option<&'a Txid>),
    Transaction(Option<&'a Txid>),
    LastIndex(KeychainKind),
}

impl MapKey<'_> {
    fn as_prefix(&self) -> Vec<u8> {
        match self {
            MapKey::Destination(_) => b"s".to_vec(),
            MapKey::Utxo(_) => b"u".to_vec(),
            MapKey::Funding((script, _)) => {
                let mut v = b"f".to_vec();
                if let Some(script) = script {
                    v.extend(serialize(*script));
                }
                v
            }
            MapKey::RawTx(_) => b"r".to_vec(),
            MapKey::Transaction(_) => b"t".to_vec(),
            MapKey::LastIndex(st) => [b"c", st.as_ref()].concat(),
        }
    }

    fn serialize_content(&self) -> Vec<u8> {
        match self {
            MapKey::Destination(Some(s)) => serialize(*s),
            MapKey::Utxo(Some(s)) => serialize(*s),
            MapKey::Funding((Some(_), Some(txid))) => serialize(*txid),
            MapKey::RawTx(Some(s)) => serialize(*s),
            MapKey::Transaction(Some(s)) => serialize(*s),
            _ => vec![],
        }
    }

    pub fn as_map_key(&self) -> Vec<u8> {
        let mut v = self.as_prefix();
        v.extend_from_slice(&self.serialize_content());

        v
    }
}

/// In-memory ephemeral database
///
/// This database can be used as a temporary storage for wallets that are not kept permanently on
/// a device, or on platforms that don't provide a filesystem, like `wasm32`.
///
/// Once it's dropped its content will be lost.
///
/// If you are looking for a permanent storage solution, you can try with the default key-value
/// database called [`Tree`](sled::Tree).
#[derive(Debug, Default)]
pub struct MemoryDatabase {
    map: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl MemoryDatabase {
    /// Create a new empty database
    pub fn new() -> Self {
        MemoryDatabase {
            map: BTreeMap::new(),
        }
    }

    fn scan_prefix<'a>(
        &'a self,
        prefix: &'a [u8],
    ) -> impl Iterator<Item = (&'a Vec<u8>, &'a Vec<u8>)> {
        self.map
            .range(prefix.to_vec()..)
            .take_while(move |(k, _)| k.starts_with(prefix))
    }
}

impl BatchOperations for MemoryDatabase {
    fn set_destination(&mut self, script: &Script, info: &DestinationInfo) -> Result<(), Error> {
        let key = MapKey::Destination(Some(script)).as_map_key();
        self.map.insert(key, serde_json::to_vec(info)?);

        Ok(())
    }

    fn set_utxo(&mut self, utxo: &LocalUtxo) -> Result<(), Error> {
        let key = MapKey::Utxo(Some(&utxo.outpoint)).as_map_key();
        self.map.insert(key, serde_json::to_vec(utxo)?);

        Ok(())
    }

    fn set_funding(&mut self, event: &FundingEvent) -> Result<(), Error> {
        let key = MapKey::Funding((Some(&event.script_pubkey), Some(&event.txid))).as_map_key();
        self.map.insert(key, serde_json::to_vec(event)?);

        Ok(())
    }

    fn set_raw_tx(&mut self, transaction: &Transaction) -> Result<(), Error> {
        let key = MapKey::RawTx(Some(&transaction.txid())).as_map_key();
        self.map.insert(key, serialize(transaction));

        Ok(())
    }

    fn set_tx(&mut self, transaction: &TransactionDetails) -> Result<(), Error> {
        let key = MapKey::Transaction(Some(&transaction.txid)).as_map_key();

        // insert the raw_tx if present
        if let Some(ref tx) = transaction.transaction {
            self.set_raw_tx(tx)?;
        }

        // remove the raw tx from the serialized version
        let mut transaction = transaction.clone();
        transaction.transaction = None;

        self.map.insert(key, serde_json::to_vec(&transaction)?);

        Ok(())
    }

    fn set_last_index(&mut self, keychain: KeychainKind, value: u32) -> Result<(), Error> {
        let key = MapKey::LastIndex(keychain).as_map_key();
        self.map.insert(key, value.to_be_bytes().to_vec());

        Ok(())
    }
}

impl Database for MemoryDatabase {
    fn iter_utxos(&self) -> Result<Vec<LocalUtxo>, Error> {
        let key = MapKey::Utxo(None).as_map_key();
        self.scan_prefix(&key)
            .map(|(_, v)| -> Result<_, Error> { Ok(serde_json::from_slice(v)?) })
            .collect()
    }

    fn iter_funding(&self, script: Option<&Script>) -> Result<Vec<FundingEvent>, Error> {
        let key = MapKey::Funding((script, None)).as_map_key();
        self.scan_prefix(&key)
            .map(|(_, v)| -> Result<_, Error> { Ok(serde_json::from_slice(v)?) })
            .collect()
    }

    fn iter_txs(&self, include_raw: bool) -> Result<Vec<TransactionDetails>, Error> {
        let key = MapKey::Transaction(None).as_map_key();
        self.scan_prefix(&key)
            .map(|(_, v)| -> Result<_, Error> {
                let mut txdetails: TransactionDetails = serde_json::from_slice(v)?;
                if include_raw {
                    txdetails.transaction = self.get_raw_tx(&txdetails.txid)?;
                }

                Ok(txdetails)
            })
            .collect()
    }

    fn get_destination(&self, script: &Script) -> Result<Option<DestinationInfo>, Error> {
        let key = MapKey::Destination(Some(script)).as_map_key();
        Ok(self
            .map
            .get(&key)
            .map(|b| serde_json::from_slice(b))
            .transpose()?)
    }

    fn get_utxo(&self, outpoint: &OutPoint) -> Result<Option<LocalUtxo>, Error> {
        let key = MapKey::Utxo(Some(outpoint)).as_map_key();
        Ok(self
            .map
            .get(&key)
            .map(|b| serde_json::from_slice(b))
            .transpose()?)
    }

    fn get_funding(&self, script: &Script, txid: &Txid) -> Result<Option<FundingEvent>, Error> {
        let key = MapKey::Funding((Some(script), Some(txid))).as_map_key();
        Ok(self
            .map
            .get(&key)
            .map(|b| serde_json::from_slice(b))
            .transpose()?)
    }

    fn get_raw_tx(&self, txid: &Txid) -> Result<Option<Transaction>, Error> {
        let key = MapKey::RawTx(Some(txid)).as_map_key();
        Ok(self.map.get(&key).map(|b| deserialize(b)).transpose()?)
    }

    fn get_tx(&self, txid: &Txid, include_raw: bool) -> Result<Option<TransactionDetails>, Error> {
        let key = MapKey::Transaction(Some(txid)).as_map_key();
        self.map
            .get(&key)
            .map(|b| -> Result<_, Error> {
                let mut txdetails: TransactionDetails = serde_json::from_slice(b)?;
                if include_raw {
                    txdetails.transaction = self.get_raw_tx(txid)?;
                }

                Ok(txdetails)
            })
            .transpose()
    }

    fn get_last_index(&self, keychain: KeychainKind) -> Result<Option<u32>, Error> {
        let key = MapKey::LastIndex(keychain).as_map_key();
        self.map
            .get(&key)
            .map(|b| -> Result<_, Error> {
                let array: [u8; 4] = b
                    .as_slice()
                    .try_into()
                    .map_err(|_| Error::InvalidU32Bytes(b.clone()))?;
                Ok(u32::from_be_bytes(array))
            })
            .transpose()
    }

    // inserts 0 if not present
    fn increment_last_index(&mut self, keychain: KeychainKind) -> Result<u32, Error> {
        let value = match self.get_last_index(keychain)? {
            Some(prev) => prev + 1,
            None => 0,
        };
        self.set_last_index(keychain, value)?;

        Ok(value)
    }
}

impl BatchDatabase for MemoryDatabase {
    type Batch = Self;

    fn begin_batch(&self) -> Self::Batch {
        MemoryDatabase::new()
    }

    fn commit_batch(&mut self, mut batch: Self::Batch) -> Result<(), Error> {
        self.map.append(&mut batch.map);

        Ok(())
    }
}
