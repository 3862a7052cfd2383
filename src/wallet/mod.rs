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

//! Wallet
//!
//! This module defines the [`Wallet`] structure.

use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use bitcoin::consensus::encode::serialize;
use bitcoin::util::bip32::{ChildNumber, ExtendedPubKey};
use bitcoin::{Address, Network, OutPoint, Script, Transaction, TxIn, TxOut, Txid};

use serde::Serialize;

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

pub mod coin_selection;
pub mod reuse;
pub mod time;
pub mod tx_builder;
pub(crate) mod utils;

use coin_selection::{
    CoinSelectionAlgorithm, CoinSelectionResult, DefaultCoinSelectionAlgorithm, Excess,
};
use reuse::ReuseClassifier;
use tx_builder::TxBuilder;
use utils::{
    confirmations, derive_address, IsDust, SecpCtx, COINBASE_MATURITY, P2PKH_SATISFACTION_WEIGHT,
};

use crate::blockchain::{Blockchain, OfflineBlockchain};
use crate::config::WalletConfig;
use crate::database::{BatchDatabase, BatchOperations, Database, DatabaseUtils};
use crate::error::{Error, InsufficientFundsReason};
use crate::types::*;

/// Type alias for a [`Wallet`] that uses [`OfflineBlockchain`]
pub type OfflineWallet<D> = Wallet<OfflineBlockchain, D>;

/// What the wallet knows about one of its destinations
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AddressInfo {
    /// The destination's script
    pub script_pubkey: Script,
    /// Whether the wallet can sign for it
    pub is_mine: bool,
    /// Whether it was imported as watch-only
    pub is_watch_only: bool,
    /// Whether it was derived from the internal keychain
    pub is_change: bool,
    /// Derivation index, `None` for watch-only destinations
    pub index: Option<u32>,
    /// Unix timestamp of when the wallet started tracking it
    pub created_at: u64,
    /// Number of distinct funding transactions counted toward reuse
    pub reuse_count: usize,
    /// Whether the destination has been reused
    pub is_dirty: bool,
}

/// A reuse-aware wallet
///
/// Addresses are derived from one extended public key per keychain: the external one for
/// [`get_new_address`](Wallet::get_new_address), the internal one for change. Chain data is fed
/// to the wallet with [`apply_transaction`](Wallet::apply_transaction).
///
/// Every query locks the database once, so it observes a consistent snapshot of the ledger
/// even while transactions are being applied from another thread.
pub struct Wallet<B: Blockchain, D: BatchDatabase> {
    external: ExtendedPubKey,
    internal: ExtendedPubKey,
    config: WalletConfig,

    current_height: RwLock<Option<u32>>,

    secp: SecpCtx,
    client: B,
    database: RwLock<D>,
}

// offline actions, always available
impl<B, D> Wallet<B, D>
where
    B: Blockchain,
    D: BatchDatabase,
{
    /// Create a new "offline" wallet
    ///
    /// Change addresses are derived from `internal` or, when it's `None`, from the child `1` of
    /// `external`.
    pub fn new_offline(
        external: ExtendedPubKey,
        internal: Option<ExtendedPubKey>,
        config: WalletConfig,
        database: D,
    ) -> Result<Self, Error> {
        let secp = SecpCtx::new();
        let internal = match internal {
            Some(xpub) => xpub,
            None => external.ckd_pub(&secp, ChildNumber::from_normal_idx(1)?)?,
        };

        debug!(
            "New wallet on {} with avoid_reuse = {}, count_unconfirmed_funding = {}",
            config.network, config.avoid_reuse, config.count_unconfirmed_funding
        );

        Ok(Wallet {
            external,
            internal,
            config,

            current_height: RwLock::new(None),

            secp,
            client: B::offline(),
            database: RwLock::new(database),
        })
    }

    /// The configuration the wallet was created with
    pub fn config(&self) -> &WalletConfig {
        &self.config
    }

    /// Return a newly derived address using the external keychain
    pub fn get_new_address(&self) -> Result<Address, Error> {
        let mut database = self.write_db()?;

        let index = database.increment_last_index(KeychainKind::External)?;
        let address = self.derive(KeychainKind::External, index)?;
        database.set_destination(
            &address.script_pubkey(),
            &DestinationInfo {
                kind: DestinationKind::Derived {
                    keychain: KeychainKind::External,
                    index,
                },
                created_at: time::get_timestamp(),
            },
        )?;

        info!("Derived new address {} at index {}", address, index);

        Ok(address)
    }

    /// Start tracking an address the wallet has no keys for
    ///
    /// Its outputs show up in the `watch_only` balance and are never selected for spending.
    /// Importing a destination that is already tracked is a no-op.
    pub fn import_watch_only(&self, address: &Address) -> Result<(), Error> {
        if !self.is_valid_network(address) {
            return Err(Error::InvalidAddressNetwork(address.clone()));
        }

        let mut database = self.write_db()?;
        let script_pubkey = address.script_pubkey();
        if database.is_tracked(&script_pubkey)? {
            return Ok(());
        }

        database.set_destination(
            &script_pubkey,
            &DestinationInfo {
                kind: DestinationKind::WatchOnly,
                created_at: time::get_timestamp(),
            },
        )?;
        info!("Imported watch-only address {}", address);

        Ok(())
    }

    /// Return whether or not a `script` is part of this wallet (either internal or external)
    pub fn is_mine(&self, script: &Script) -> Result<bool, Error> {
        self.read_db()?.is_mine(script)
    }

    /// Set the height of the chain tip, used to decide coinbase maturity
    pub fn set_current_height(&self, height: u32) -> Result<(), Error> {
        *self
            .current_height
            .write()
            .map_err(|_| Error::Generic("Wallet height lock poisoned".into()))? = Some(height);

        Ok(())
    }

    /// Height of the chain tip, if known
    pub fn current_height(&self) -> Result<Option<u32>, Error> {
        self.current_height
            .read()
            .map(|h| *h)
            .map_err(|_| Error::Generic("Wallet height lock poisoned".into()))
    }

    /// Record a transaction seen on the network, confirmed at `height` or unconfirmed if `None`
    ///
    /// Every output paying a tracked destination becomes a funding event of that destination
    /// and an output of the wallet, and every wallet output it spends is marked as spent.
    /// Applying the same transaction again only updates its confirmation state.
    pub fn apply_transaction(
        &self,
        tx: &Transaction,
        height: Option<u32>,
    ) -> Result<TransactionDetails, Error> {
        let mut database = self.write_db()?;
        self.apply_transaction_inner(&mut database, tx, height)
    }

    /// Record a transaction created by this wallet, after it has been broadcast
    pub fn commit_tx(&self, tx: &Transaction) -> Result<TransactionDetails, Error> {
        let mut database = self.write_db()?;
        if let Some(details) = database.get_tx(&tx.txid(), false)? {
            return Ok(details);
        }

        let details = self.apply_transaction_inner(&mut database, tx, None)?;
        info!(
            "Committed transaction {}, sent {} received {} fees {:?}",
            details.txid, details.sent, details.received, details.fees
        );

        Ok(details)
    }

    /// Return the list of unspent outputs of this wallet, watch-only ones included
    pub fn list_unspent(&self) -> Result<Vec<LocalUtxo>, Error> {
        Ok(self
            .read_db()?
            .iter_utxos()?
            .into_iter()
            .filter(|u| !u.is_spent)
            .collect())
    }

    /// Return the list of unspent outputs with their spendability and reuse flag, derived from
    /// the current state of the ledger
    pub fn list_unspent_classified(&self) -> Result<Vec<ClassifiedUtxo>, Error> {
        let database = self.read_db()?;
        self.classify(&database)
    }

    /// Return the list of transactions made and received by the wallet
    pub fn list_transactions(&self, include_raw: bool) -> Result<Vec<TransactionDetails>, Error> {
        self.read_db()?.iter_txs(include_raw)
    }

    /// Number of distinct funding transactions of a tracked destination
    pub fn reuse_count(&self, script: &Script) -> Result<usize, Error> {
        let database = self.read_db()?;
        if !database.is_tracked(script)? {
            return Err(Error::UnknownDestination(script.clone()));
        }

        self.classifier(&database).reuse_count(script)
    }

    /// Whether `utxo` sits on a reused destination
    pub fn is_dirty(&self, utxo: &LocalUtxo) -> Result<bool, Error> {
        let database = self.read_db()?;
        self.classifier(&database).is_dirty(utxo)
    }

    /// Return what the wallet knows about `address`
    pub fn get_address_info(&self, address: &Address) -> Result<AddressInfo, Error> {
        let database = self.read_db()?;
        let script_pubkey = address.script_pubkey();
        let info = database
            .get_destination(&script_pubkey)?
            .ok_or_else(|| Error::UnknownDestination(script_pubkey.clone()))?;
        let reuse_count = self.classifier(&database).reuse_count(&script_pubkey)?;

        let index = match info.kind {
            DestinationKind::Derived { index, .. } => Some(index),
            DestinationKind::WatchOnly => None,
        };

        Ok(AddressInfo {
            script_pubkey,
            is_mine: !info.is_watch_only(),
            is_watch_only: info.is_watch_only(),
            is_change: info.keychain() == Some(KeychainKind::Internal),
            index,
            created_at: info.created_at,
            reuse_count,
            is_dirty: reuse_count > 1,
        })
    }

    /// Return the balance, partitioned by spendability and by reuse
    pub fn get_balances(&self) -> Result<Balance, Error> {
        let database = self.read_db()?;
        let balance = self
            .classify(&database)?
            .into_iter()
            .fold(Balance::default(), |mut balance, c| {
                let value = c.utxo.txout.value;
                match c.spendability {
                    Spendability::Spendable if c.is_dirty => balance.used += value,
                    Spendability::Spendable => balance.trusted += value,
                    Spendability::Untrusted => balance.untrusted_pending += value,
                    Spendability::Immature => balance.immature += value,
                    Spendability::WatchOnly => balance.watch_only += value,
                }
                balance
            });

        Ok(balance)
    }

    /// Return the spendable balance under the configured policy
    ///
    /// With `avoid_reuse` this only includes outputs on destinations funded once.
    pub fn get_balance(&self) -> Result<u64, Error> {
        Ok(self.get_balances()?.spendable(self.config.avoid_reuse))
    }

    /// Return the spendable value sitting on reused destinations
    pub fn get_dirty_balance(&self) -> Result<u64, Error> {
        Ok(self.get_balances()?.used)
    }

    /// Select the outputs that would fund a payment of `target_amount` plus `fee_estimate`
    ///
    /// This is a dry run: nothing is reserved or written. The cost of the inputs is added on
    /// top of `fee_estimate` at the configured fee rate.
    pub fn select_coins(
        &self,
        target_amount: u64,
        fee_estimate: u64,
        allow_dirty: bool,
    ) -> Result<CoinSelectionResult, Error> {
        let database = self.read_db()?;
        let (allowed, excluded) = self.candidates(&database, allow_dirty)?;
        let (_, drain_script) = self.peek_change_script(&database)?;

        let target_amount = target_amount
            .checked_add(fee_estimate)
            .ok_or_else(|| out_of_range(&allowed))?;

        self.run_selection(
            &DefaultCoinSelectionAlgorithm::default(),
            allowed,
            excluded,
            self.config.fee_rate,
            target_amount,
            &drain_script,
        )
    }

    /// Create a new unsigned transaction following the options specified in the `builder`
    ///
    /// Nothing is written to the database: the transaction only becomes part of the wallet
    /// history once it's passed to [`commit_tx`](Wallet::commit_tx).
    pub fn create_tx<Cs: CoinSelectionAlgorithm>(
        &self,
        builder: TxBuilder<Cs>,
    ) -> Result<(Transaction, TransactionDetails), Error> {
        let database = self.read_db()?;
        self.create_tx_inner(&database, builder)
    }

    /// Return a reference to the internal blockchain client
    pub fn client(&self) -> &B {
        &self.client
    }

    /// Pay `amount` satoshi to `address`, then broadcast and commit the transaction
    ///
    /// With `avoid_reuse` enabled outputs on reused destinations are only spent when
    /// `allow_dirty` is set. If the selection or the broadcast fail the wallet is left
    /// untouched.
    ///
    /// The database stays locked from the selection to the commit, so concurrent sends never
    /// pick the same outputs or the same change address.
    pub fn send_to_address(
        &self,
        address: &Address,
        amount: u64,
        allow_dirty: bool,
    ) -> Result<Txid, Error> {
        if !self.is_valid_network(address) {
            return Err(Error::InvalidAddressNetwork(address.clone()));
        }
        if !self.client.is_online() {
            return Err(Error::OfflineClient);
        }

        let mut database = self.write_db()?;

        let builder = TxBuilder::with_recipients(vec![(address.script_pubkey(), amount)])
            .allow_dirty(allow_dirty);
        let (tx, details) = self.create_tx_inner(&database, builder)?;

        self.client.broadcast(&tx)?;
        self.apply_transaction_inner(&mut database, &tx, None)?;

        info!(
            "Sent {} sat to {} in {} (fees {:?})",
            amount, address, details.txid, details.fees
        );

        Ok(details.txid)
    }

    // Internals

    fn create_tx_inner<Cs: CoinSelectionAlgorithm>(
        &self,
        database: &D,
        builder: TxBuilder<Cs>,
    ) -> Result<(Transaction, TransactionDetails), Error> {
        if builder.recipients.is_empty() {
            return Err(Error::NoRecipients);
        }

        let fee_rate = builder.fee_rate.unwrap_or(self.config.fee_rate);

        let mut tx = Transaction {
            version: 1,
            lock_time: 0,
            input: vec![],
            output: vec![],
        };

        let mut fee_amount = fee_rate.fee_wu(tx.get_weight());
        let mut outgoing: u64 = 0;
        let mut received: u64 = 0;

        for (index, (script_pubkey, satoshi)) in builder.recipients.iter().enumerate() {
            if satoshi.is_dust() {
                return Err(Error::OutputBelowDustLimit(index));
            }

            if database.is_mine(script_pubkey)? {
                received = received.saturating_add(*satoshi);
            }

            let new_out = TxOut {
                script_pubkey: script_pubkey.clone(),
                value: *satoshi,
            };
            fee_amount += fee_rate.fee_vb(serialize(&new_out).len());

            tx.output.push(new_out);

            outgoing = outgoing
                .checked_add(*satoshi)
                .ok_or_else(|| out_of_range(&[]))?;
        }

        let (allowed, excluded) = self.candidates(database, builder.allow_dirty)?;
        let (change_index, drain_script) = self.peek_change_script(database)?;
        let target_amount = outgoing
            .checked_add(fee_amount)
            .ok_or_else(|| out_of_range(&allowed))?;

        let start_time = time::Instant::new();
        let selection = self.run_selection(
            &builder.coin_selection,
            allowed,
            excluded,
            fee_rate,
            target_amount,
            &drain_script,
        )?;
        debug!(
            "Selected {} inputs in {} ms",
            selection.selected.len(),
            start_time.elapsed().as_millis()
        );

        tx.input = selection
            .selected
            .iter()
            .map(|utxo| TxIn {
                previous_output: utxo.outpoint,
                script_sig: Script::default(),
                sequence: 0xFFFF_FFFF,
                witness: vec![],
            })
            .collect();

        if let Excess::Change { amount, .. } = selection.excess {
            debug!("Change of {} to internal index {}", amount, change_index);

            received += amount;
            tx.output.push(TxOut {
                script_pubkey: drain_script,
                value: amount,
            });
        }

        // sort input/outputs according to the chosen algorithm
        builder.ordering.modify_tx(&mut tx);

        let selected_amount = selection.selected_amount();
        let transaction_details = TransactionDetails {
            transaction: Some(tx.clone()),
            txid: tx.txid(),
            timestamp: time::get_timestamp(),
            received,
            sent: selected_amount,
            fees: Some(selected_amount - outgoing - selection.change_amount()),
            height: None,
        };

        Ok((tx, transaction_details))
    }

    fn read_db(&self) -> Result<RwLockReadGuard<'_, D>, Error> {
        self.database
            .read()
            .map_err(|_| Error::Generic("Wallet database lock poisoned".into()))
    }

    fn write_db(&self) -> Result<RwLockWriteGuard<'_, D>, Error> {
        self.database
            .write()
            .map_err(|_| Error::Generic("Wallet database lock poisoned".into()))
    }

    fn classifier<'a>(&self, database: &'a D) -> ReuseClassifier<'a, D> {
        ReuseClassifier::new(database, self.config.count_unconfirmed_funding)
    }

    fn is_valid_network(&self, address: &Address) -> bool {
        // regtest addresses share the testnet base58 prefixes
        match (self.config.network, address.network) {
            (Network::Testnet, Network::Regtest) | (Network::Regtest, Network::Testnet) => true,
            (network, address_network) => network == address_network,
        }
    }

    fn derive(&self, keychain: KeychainKind, index: u32) -> Result<Address, Error> {
        let xpub = match keychain {
            KeychainKind::External => &self.external,
            KeychainKind::Internal => &self.internal,
        };

        derive_address(&self.secp, xpub, index, self.config.network)
    }

    // The next change script, without marking it as used
    fn peek_change_script(&self, database: &D) -> Result<(u32, Script), Error> {
        let index = database
            .get_last_index(KeychainKind::Internal)?
            .map_or(0, |i| i + 1);

        Ok((
            index,
            self.derive(KeychainKind::Internal, index)?.script_pubkey(),
        ))
    }

    // Mark the change script at `index` as handed out. The index and the destination are
    // written in the same batch.
    fn reveal_change<Bo: BatchOperations>(
        &self,
        batch: &mut Bo,
        index: u32,
        script_pubkey: &Script,
    ) -> Result<DestinationInfo, Error> {
        let info = DestinationInfo {
            kind: DestinationKind::Derived {
                keychain: KeychainKind::Internal,
                index,
            },
            created_at: time::get_timestamp(),
        };
        batch.set_last_index(KeychainKind::Internal, index)?;
        batch.set_destination(script_pubkey, &info)?;

        Ok(info)
    }

    fn classify(&self, database: &D) -> Result<Vec<ClassifiedUtxo>, Error> {
        let current_height = self.current_height()?;
        let counts = self.classifier(database).reuse_counts()?;

        database
            .iter_utxos()?
            .into_iter()
            .filter(|utxo| !utxo.is_spent)
            .map(|utxo| -> Result<_, Error> {
                let spendability = if utxo.is_watch_only() {
                    Spendability::WatchOnly
                } else if utxo.is_coinbase
                    && confirmations(utxo.height, current_height) < COINBASE_MATURITY
                {
                    Spendability::Immature
                } else if utxo.height.is_none()
                    && !database
                        .get_funding(&utxo.txout.script_pubkey, &utxo.outpoint.txid)?
                        .map_or(false, |e| e.is_own)
                {
                    Spendability::Untrusted
                } else {
                    Spendability::Spendable
                };

                Ok(ClassifiedUtxo {
                    is_dirty: counts.is_dirty(&utxo),
                    utxo,
                    spendability,
                })
            })
            .collect()
    }

    // Spendable outputs split between the ones the selection may use and the ones the reuse
    // policy keeps out
    fn candidates(
        &self,
        database: &D,
        allow_dirty: bool,
    ) -> Result<(Vec<WeightedUtxo>, Vec<WeightedUtxo>), Error> {
        let avoid_dirty = self.config.avoid_reuse && !allow_dirty;

        let (excluded, allowed): (Vec<_>, Vec<_>) = self
            .classify(database)?
            .into_iter()
            .filter(|c| c.spendability == Spendability::Spendable)
            .partition(|c| avoid_dirty && c.is_dirty);

        debug!(
            "{} candidate outputs, {} excluded by the reuse policy",
            allowed.len(),
            excluded.len()
        );

        let weighted = |c: ClassifiedUtxo| WeightedUtxo {
            satisfaction_weight: P2PKH_SATISFACTION_WEIGHT,
            utxo: c.utxo,
        };

        Ok((
            allowed.into_iter().map(weighted).collect(),
            excluded.into_iter().map(weighted).collect(),
        ))
    }

    fn run_selection<Cs: CoinSelectionAlgorithm>(
        &self,
        coin_selection: &Cs,
        allowed: Vec<WeightedUtxo>,
        excluded: Vec<WeightedUtxo>,
        fee_rate: FeeRate,
        target_amount: u64,
        drain_script: &Script,
    ) -> Result<CoinSelectionResult, Error> {
        if excluded.is_empty() {
            return coin_selection.coin_select(
                vec![],
                allowed,
                fee_rate,
                target_amount,
                drain_script,
            );
        }

        match coin_selection.coin_select(
            vec![],
            allowed.clone(),
            fee_rate,
            target_amount,
            drain_script,
        ) {
            Err(Error::InsufficientFunds {
                needed, available, ..
            }) => {
                // find out whether the dirty outputs would have made a difference
                let excluded_value = excluded.iter().map(|u| u.utxo.txout.value).sum();
                let everything = allowed.into_iter().chain(excluded).collect();
                let reason = match coin_selection.coin_select(
                    vec![],
                    everything,
                    fee_rate,
                    target_amount,
                    drain_script,
                ) {
                    Ok(_) => InsufficientFundsReason::ExcludedByReusePolicy {
                        excluded: excluded_value,
                    },
                    Err(_) => InsufficientFundsReason::NotEnoughFunds,
                };
                debug!("Selection failed: {}", reason);

                Err(Error::InsufficientFunds {
                    needed,
                    available,
                    reason,
                })
            }
            other => other,
        }
    }

    fn apply_transaction_inner(
        &self,
        database: &mut D,
        tx: &Transaction,
        height: Option<u32>,
    ) -> Result<TransactionDetails, Error> {
        let txid = tx.txid();
        let is_coinbase = tx.is_coin_base();

        let mut batch = database.begin_batch();

        // a change output can show up before the wallet itself committed the spend, e.g. when
        // restoring or when another instance created the transaction
        let (change_index, change_script) = self.peek_change_script(database)?;
        let change_info = if tx.output.iter().any(|o| o.script_pubkey == change_script) {
            debug!("{} pays internal index {}", txid, change_index);
            Some(self.reveal_change(&mut batch, change_index, &change_script)?)
        } else {
            None
        };

        let mut sent = 0;
        let mut is_own = false;
        let mut touched = false;
        let mut inputs_value = if is_coinbase { None } else { Some(0u64) };
        if !is_coinbase {
            for input in &tx.input {
                let mut utxo = match database.get_utxo(&input.previous_output)? {
                    Some(utxo) => utxo,
                    None => {
                        inputs_value = None;
                        continue;
                    }
                };

                touched = true;
                inputs_value = inputs_value.map(|v| v + utxo.txout.value);
                if !utxo.is_watch_only() {
                    sent += utxo.txout.value;
                    is_own = true;
                }

                if !utxo.is_spent {
                    debug!("Output {} spent by {}", utxo.outpoint, txid);

                    utxo.is_spent = true;
                    batch.set_utxo(&utxo)?;
                }
            }
        }

        let mut received = 0;
        let mut funded: Vec<(Script, Vec<u32>)> = Vec::new();
        for (vout, output) in tx.output.iter().enumerate() {
            let info = match &change_info {
                Some(info) if output.script_pubkey == change_script => info.clone(),
                _ => match database.get_destination(&output.script_pubkey)? {
                    Some(info) => info,
                    None => continue,
                },
            };

            let vout = vout as u32;
            if !info.is_watch_only() {
                received += output.value;
            }

            let outpoint = OutPoint::new(txid, vout);
            // never resurrect an output that was spent already
            let is_spent = database.get_utxo(&outpoint)?.map_or(false, |u| u.is_spent);
            batch.set_utxo(&LocalUtxo {
                outpoint,
                txout: output.clone(),
                keychain: info.keychain(),
                height,
                is_coinbase,
                is_spent,
            })?;

            match funded
                .iter_mut()
                .find(|(script, _)| script == &output.script_pubkey)
            {
                Some((_, vouts)) => vouts.push(vout),
                None => funded.push((output.script_pubkey.clone(), vec![vout])),
            }
        }

        touched |= !funded.is_empty();
        for (script_pubkey, vouts) in funded {
            let event = database.merged_funding(FundingEvent {
                txid,
                script_pubkey,
                vouts,
                height,
                is_own,
            })?;
            trace!("Funding event {:?}", event);

            batch.set_funding(&event)?;
        }

        let outputs_value: u64 = tx.output.iter().map(|o| o.value).sum();
        let timestamp = database
            .get_tx(&txid, false)?
            .map_or_else(time::get_timestamp, |previous| previous.timestamp);
        let details = TransactionDetails {
            transaction: Some(tx.clone()),
            txid,
            timestamp,
            received,
            sent,
            fees: inputs_value.map(|v| v.saturating_sub(outputs_value)),
            height,
        };

        if touched {
            debug!(
                "Applying {} at height {:?}: received {} sent {}",
                txid, height, received, sent
            );
            batch.set_tx(&details)?;
        }

        database.commit_batch(batch)?;

        Ok(details)
    }
}

// Requested amounts that don't fit in a u64 can never be funded
fn out_of_range(available: &[WeightedUtxo]) -> Error {
    Error::InsufficientFunds {
        needed: u64::MAX,
        available: available
            .iter()
            .fold(0u64, |acc, u| acc.saturating_add(u.utxo.txout.value)),
        reason: InsufficientFundsReason::NotEnoughFunds,
    }
}

impl<B, D> Wallet<B, D>
where
    B: Blockchain,
    D: BatchDatabase,
{
    /// Create a new wallet that broadcasts through `client`
    pub fn new(
        external: ExtendedPubKey,
        internal: Option<ExtendedPubKey>,
        config: WalletConfig,
        database: D,
        client: B,
    ) -> Result<Self, Error> {
        let mut wallet = Self::new_offline(external, internal, config, database)?;
        wallet.client = client;

        Ok(wallet)
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::Duration;

    use bitcoin::hashes::Hash;
    use bitcoin::secp256k1::Secp256k1;
    use bitcoin::util::bip32::ExtendedPrivKey;

    use super::*;
    use crate::database::memory::MemoryDatabase;

    const COIN: u64 = 100_000_000;

    #[derive(Debug)]
    struct AcceptAll;

    impl Blockchain for AcceptAll {
        fn is_online(&self) -> bool {
            true
        }

        fn offline() -> Self {
            AcceptAll
        }

        fn broadcast(&self, _tx: &Transaction) -> Result<(), Error> {
            Ok(())
        }
    }

    // Relays transactions slowly enough for concurrent sends to overlap
    #[derive(Debug, Default)]
    struct SlowRelay {
        sent: Mutex<Vec<Transaction>>,
    }

    impl Blockchain for SlowRelay {
        fn is_online(&self) -> bool {
            true
        }

        fn offline() -> Self {
            SlowRelay::default()
        }

        fn broadcast(&self, tx: &Transaction) -> Result<(), Error> {
            thread::sleep(Duration::from_millis(50));
            self.sent.lock().unwrap().push(tx.clone());

            Ok(())
        }
    }

    // A memory database whose batches can be made to fail
    #[derive(Debug, Default)]
    struct FlakyDatabase {
        inner: MemoryDatabase,
        fail_commit: Arc<AtomicBool>,
    }

    impl BatchOperations for FlakyDatabase {
        fn set_destination(
            &mut self,
            script: &Script,
            info: &DestinationInfo,
        ) -> Result<(), Error> {
            self.inner.set_destination(script, info)
        }
        fn set_utxo(&mut self, utxo: &LocalUtxo) -> Result<(), Error> {
            self.inner.set_utxo(utxo)
        }
        fn set_funding(&mut self, event: &FundingEvent) -> Result<(), Error> {
            self.inner.set_funding(event)
        }
        fn set_raw_tx(&mut self, transaction: &Transaction) -> Result<(), Error> {
            self.inner.set_raw_tx(transaction)
        }
        fn set_tx(&mut self, transaction: &TransactionDetails) -> Result<(), Error> {
            self.inner.set_tx(transaction)
        }
        fn set_last_index(&mut self, keychain: KeychainKind, value: u32) -> Result<(), Error> {
            self.inner.set_last_index(keychain, value)
        }
    }

    impl Database for FlakyDatabase {
        fn iter_utxos(&self) -> Result<Vec<LocalUtxo>, Error> {
            self.inner.iter_utxos()
        }
        fn iter_funding(&self, script: Option<&Script>) -> Result<Vec<FundingEvent>, Error> {
            self.inner.iter_funding(script)
        }
        fn iter_txs(&self, include_raw: bool) -> Result<Vec<TransactionDetails>, Error> {
            self.inner.iter_txs(include_raw)
        }
        fn get_destination(&self, script: &Script) -> Result<Option<DestinationInfo>, Error> {
            self.inner.get_destination(script)
        }
        fn get_utxo(&self, outpoint: &OutPoint) -> Result<Option<LocalUtxo>, Error> {
            self.inner.get_utxo(outpoint)
        }
        fn get_funding(
            &self,
            script: &Script,
            txid: &Txid,
        ) -> Result<Option<FundingEvent>, Error> {
            self.inner.get_funding(script, txid)
        }
        fn get_raw_tx(&self, txid: &Txid) -> Result<Option<Transaction>, Error> {
            self.inner.get_raw_tx(txid)
        }
        fn get_tx(
            &self,
            txid: &Txid,
            include_raw: bool,
        ) -> Result<Option<TransactionDetails>, Error> {
            self.inner.get_tx(txid, include_raw)
        }
        fn get_last_index(&self, keychain: KeychainKind) -> Result<Option<u32>, Error> {
            self.inner.get_last_index(keychain)
        }
        fn increment_last_index(&mut self, keychain: KeychainKind) -> Result<u32, Error> {
            self.inner.increment_last_index(keychain)
        }
    }

    impl BatchDatabase for FlakyDatabase {
        type Batch = MemoryDatabase;

        fn begin_batch(&self) -> Self::Batch {
            self.inner.begin_batch()
        }

        fn commit_batch(&mut self, batch: Self::Batch) -> Result<(), Error> {
            if self.fail_commit.load(Ordering::SeqCst) {
                return Err(Error::Generic("Batch rejected".into()));
            }

            self.inner.commit_batch(batch)
        }
    }

    fn get_test_wallet<B: Blockchain>(config: WalletConfig) -> Wallet<B, MemoryDatabase> {
        let secp = Secp256k1::new();
        let xprv = ExtendedPrivKey::new_master(Network::Regtest, &[0x42; 32]).unwrap();
        let xpub = ExtendedPubKey::from_private(&secp, &xprv);

        let wallet = Wallet::new_offline(xpub, None, config, MemoryDatabase::new()).unwrap();
        wallet.set_current_height(200).unwrap();

        wallet
    }

    fn avoid_reuse() -> WalletConfig {
        WalletConfig {
            avoid_reuse: true,
            ..Default::default()
        }
    }

    fn foreign_script() -> Script {
        Script::from(vec![0x51])
    }

    // A transaction spending a foreign output, paying `outputs`
    fn incoming_tx(seed: u32, outputs: Vec<(Script, u64)>) -> Transaction {
        Transaction {
            version: 1,
            lock_time: 0,
            input: vec![TxIn {
                previous_output: OutPoint::new(Txid::hash(&seed.to_be_bytes()), 0),
                script_sig: Script::new(),
                sequence: 0xFFFF_FFFF,
                witness: vec![],
            }],
            output: outputs
                .into_iter()
                .map(|(script_pubkey, value)| TxOut {
                    script_pubkey,
                    value,
                })
                .collect(),
        }
    }

    fn coinbase_tx(script: Script, value: u64, height: u32) -> Transaction {
        Transaction {
            version: 1,
            lock_time: 0,
            input: vec![TxIn {
                previous_output: OutPoint::null(),
                script_sig: Script::from(height.to_le_bytes().to_vec()),
                sequence: 0xFFFF_FFFF,
                witness: vec![],
            }],
            output: vec![TxOut {
                script_pubkey: script,
                value,
            }],
        }
    }

    #[test]
    fn test_new_address_is_tracked() {
        let wallet: OfflineWallet<_> = get_test_wallet(WalletConfig::default());

        let first = wallet.get_new_address().unwrap();
        let second = wallet.get_new_address().unwrap();
        assert_ne!(first, second);

        let info = wallet.get_address_info(&first).unwrap();
        assert!(info.is_mine);
        assert!(!info.is_change);
        assert_eq!(info.index, Some(0));
        assert_eq!(info.reuse_count, 0);
        assert_eq!(wallet.reuse_count(&second.script_pubkey()).unwrap(), 0);
    }

    #[test]
    fn test_unknown_destination() {
        let wallet: OfflineWallet<_> = get_test_wallet(WalletConfig::default());

        assert!(matches!(
            wallet.reuse_count(&foreign_script()),
            Err(Error::UnknownDestination(_))
        ));
    }

    #[test]
    fn test_receive_is_clean() {
        let wallet: OfflineWallet<_> = get_test_wallet(avoid_reuse());
        let address = wallet.get_new_address().unwrap();

        wallet
            .apply_transaction(
                &incoming_tx(0, vec![(address.script_pubkey(), 10 * COIN)]),
                Some(100),
            )
            .unwrap();

        assert_eq!(wallet.get_balance().unwrap(), 10 * COIN);
        assert_eq!(wallet.get_dirty_balance().unwrap(), 0);
        let utxos = wallet.list_unspent_classified().unwrap();
        assert_eq!(utxos.len(), 1);
        assert!(!utxos[0].is_dirty);
        assert_eq!(utxos[0].spendability, Spendability::Spendable);
    }

    #[test]
    fn test_many_outputs_single_event() {
        let wallet: OfflineWallet<_> = get_test_wallet(avoid_reuse());
        let script = wallet.get_new_address().unwrap().script_pubkey();

        wallet
            .apply_transaction(
                &incoming_tx(0, vec![(script.clone(), COIN), (script.clone(), COIN)]),
                Some(100),
            )
            .unwrap();

        assert_eq!(wallet.reuse_count(&script).unwrap(), 1);
        assert_eq!(wallet.get_balance().unwrap(), 2 * COIN);
        assert!(wallet
            .list_unspent_classified()
            .unwrap()
            .iter()
            .all(|c| !c.is_dirty));
    }

    #[test]
    fn test_second_funding_marks_old_outputs_dirty() {
        let wallet: OfflineWallet<_> = get_test_wallet(avoid_reuse());
        let script = wallet.get_new_address().unwrap().script_pubkey();

        wallet
            .apply_transaction(&incoming_tx(0, vec![(script.clone(), COIN)]), Some(100))
            .unwrap();
        let old_output = wallet.list_unspent().unwrap().remove(0);
        assert!(!wallet.is_dirty(&old_output).unwrap());

        wallet
            .apply_transaction(&incoming_tx(1, vec![(script.clone(), COIN)]), Some(101))
            .unwrap();

        assert!(wallet.is_dirty(&old_output).unwrap());
        assert_eq!(wallet.reuse_count(&script).unwrap(), 2);
        assert_eq!(wallet.get_balance().unwrap(), 0);
        assert_eq!(wallet.get_dirty_balance().unwrap(), 2 * COIN);

        let balances = wallet.get_balances().unwrap();
        assert_eq!(balances.trusted, 0);
        assert_eq!(balances.used, 2 * COIN);
    }

    #[test]
    fn test_plain_wallet_ignores_dirtiness() {
        let wallet: OfflineWallet<_> = get_test_wallet(WalletConfig::default());
        let script = wallet.get_new_address().unwrap().script_pubkey();

        wallet
            .apply_transaction(&incoming_tx(0, vec![(script.clone(), COIN)]), Some(100))
            .unwrap();
        wallet
            .apply_transaction(&incoming_tx(1, vec![(script.clone(), COIN)]), Some(101))
            .unwrap();

        // the flag is still computed
        assert_eq!(wallet.get_dirty_balance().unwrap(), 2 * COIN);
        assert_eq!(wallet.get_balance().unwrap(), 2 * COIN);
        assert!(wallet.select_coins(COIN + COIN / 2, 0, false).is_ok());
    }

    #[test]
    fn test_replayed_transaction_is_idempotent() {
        let wallet: OfflineWallet<_> = get_test_wallet(avoid_reuse());
        let script = wallet.get_new_address().unwrap().script_pubkey();
        let tx = incoming_tx(0, vec![(script.clone(), COIN)]);

        wallet.apply_transaction(&tx, None).unwrap();
        wallet.apply_transaction(&tx, None).unwrap();
        assert_eq!(wallet.get_balances().unwrap().untrusted_pending, COIN);

        wallet.apply_transaction(&tx, Some(150)).unwrap();
        wallet.apply_transaction(&tx, Some(150)).unwrap();

        assert_eq!(wallet.reuse_count(&script).unwrap(), 1);
        assert_eq!(wallet.get_balance().unwrap(), COIN);
        assert_eq!(wallet.list_unspent().unwrap().len(), 1);
        assert_eq!(wallet.list_transactions(false).unwrap().len(), 1);
        assert_eq!(
            wallet.list_transactions(false).unwrap()[0].height,
            Some(150)
        );
    }

    #[test]
    fn test_unrelated_transaction_is_ignored() {
        let wallet: OfflineWallet<_> = get_test_wallet(WalletConfig::default());

        let details = wallet
            .apply_transaction(&incoming_tx(0, vec![(foreign_script(), COIN)]), Some(1))
            .unwrap();

        assert_eq!(details.received, 0);
        assert!(wallet.list_transactions(false).unwrap().is_empty());
    }

    #[test]
    fn test_immature_coinbase() {
        let wallet: OfflineWallet<_> = get_test_wallet(WalletConfig::default());
        let script = wallet.get_new_address().unwrap().script_pubkey();

        wallet
            .apply_transaction(&coinbase_tx(script.clone(), 50 * COIN, 150), Some(150))
            .unwrap();
        assert_eq!(wallet.get_balances().unwrap().immature, 50 * COIN);
        assert_eq!(wallet.get_balance().unwrap(), 0);

        wallet.set_current_height(249).unwrap();
        assert_eq!(wallet.get_balance().unwrap(), 50 * COIN);
    }

    #[test]
    fn test_watch_only() {
        let wallet: OfflineWallet<_> = get_test_wallet(avoid_reuse());
        let watched = Address::p2sh(&foreign_script(), Network::Regtest);
        wallet.import_watch_only(&watched).unwrap();

        wallet
            .apply_transaction(
                &incoming_tx(0, vec![(watched.script_pubkey(), COIN)]),
                Some(100),
            )
            .unwrap();
        wallet
            .apply_transaction(
                &incoming_tx(1, vec![(watched.script_pubkey(), COIN)]),
                Some(100),
            )
            .unwrap();

        let info = wallet.get_address_info(&watched).unwrap();
        assert!(info.is_watch_only);
        assert!(info.is_dirty);

        let balances = wallet.get_balances().unwrap();
        assert_eq!(balances.watch_only, 2 * COIN);
        assert_eq!(balances.used, 0);
        assert_eq!(balances.total(), 0);
        assert!(matches!(
            wallet.select_coins(COIN / 2, 0, true),
            Err(Error::InsufficientFunds { .. })
        ));
    }

    #[test]
    fn test_import_wrong_network() {
        let wallet: OfflineWallet<_> = get_test_wallet(WalletConfig::default());
        let mainnet = Address::p2sh(&foreign_script(), Network::Bitcoin);

        assert!(matches!(
            wallet.import_watch_only(&mainnet),
            Err(Error::InvalidAddressNetwork(_))
        ));
    }

    #[test]
    fn test_untrusted_is_not_spendable() {
        let wallet: OfflineWallet<_> = get_test_wallet(WalletConfig::default());
        let script = wallet.get_new_address().unwrap().script_pubkey();

        wallet
            .apply_transaction(&incoming_tx(0, vec![(script, COIN)]), None)
            .unwrap();

        assert_eq!(wallet.get_balance().unwrap(), 0);
        assert!(wallet.select_coins(COIN / 2, 0, false).is_err());
    }

    #[test]
    fn test_create_tx_empty_recipients() {
        let wallet: OfflineWallet<_> = get_test_wallet(WalletConfig::default());

        assert!(matches!(
            wallet.create_tx(TxBuilder::with_recipients(vec![])),
            Err(Error::NoRecipients)
        ));
    }

    #[test]
    fn test_create_tx_dust_recipient() {
        let wallet: OfflineWallet<_> = get_test_wallet(WalletConfig::default());

        assert!(matches!(
            wallet.create_tx(TxBuilder::with_recipients(vec![(foreign_script(), 546)])),
            Err(Error::OutputBelowDustLimit(0))
        ));
    }

    #[test]
    fn test_create_tx_change_to_fresh_internal_address() {
        let wallet: OfflineWallet<_> = get_test_wallet(WalletConfig::default());
        let script = wallet.get_new_address().unwrap().script_pubkey();
        wallet
            .apply_transaction(&incoming_tx(0, vec![(script.clone(), COIN)]), Some(100))
            .unwrap();

        let (tx, details) = wallet
            .create_tx(TxBuilder::with_recipients(vec![(foreign_script(), COIN / 2)]))
            .unwrap();

        assert_eq!(tx.input.len(), 1);
        assert_eq!(tx.output.len(), 2);
        let change = tx
            .output
            .iter()
            .find(|o| o.script_pubkey != foreign_script())
            .unwrap();
        assert_ne!(change.script_pubkey, script);
        assert_eq!(details.received, change.value);
        assert_eq!(
            details.sent,
            COIN / 2 + change.value + details.fees.unwrap()
        );

        // nothing is written until the transaction is committed
        assert!(!wallet.is_mine(&change.script_pubkey).unwrap());

        wallet.commit_tx(&tx).unwrap();
        assert!(wallet.is_mine(&change.script_pubkey).unwrap());
        let info = wallet
            .get_address_info(&Address::from_script(&change.script_pubkey, Network::Regtest).unwrap())
            .unwrap();
        assert!(info.is_change);
        assert_eq!(info.reuse_count, 1);

        // own unconfirmed change is spendable right away
        assert_eq!(wallet.get_balance().unwrap(), change.value);
    }

    #[test]
    fn test_create_tx_skip_change_dust() {
        let wallet: OfflineWallet<_> = get_test_wallet(WalletConfig::default());
        let script = wallet.get_new_address().unwrap().script_pubkey();
        wallet
            .apply_transaction(&incoming_tx(0, vec![(script, 100_000)]), Some(100))
            .unwrap();

        let (tx, details) = wallet
            .create_tx(TxBuilder::with_recipients(vec![(foreign_script(), 99_500)]))
            .unwrap();

        assert_eq!(tx.output.len(), 1);
        assert_eq!(details.fees, Some(500));
        assert_eq!(details.received, 0);
    }

    #[test]
    fn test_policy_failure_reason() {
        let wallet: Wallet<AcceptAll, _> = get_test_wallet(avoid_reuse());
        let address = wallet.get_new_address().unwrap();
        let script = address.script_pubkey();

        wallet
            .apply_transaction(&incoming_tx(0, vec![(script.clone(), 10 * COIN)]), Some(100))
            .unwrap();
        let destination = Address::p2sh(&foreign_script(), Network::Regtest);
        wallet
            .send_to_address(&destination, 5 * COIN, false)
            .unwrap();
        wallet
            .apply_transaction(&incoming_tx(1, vec![(script.clone(), 10 * COIN)]), Some(101))
            .unwrap();

        assert_eq!(wallet.get_dirty_balance().unwrap(), 10 * COIN);
        let clean = wallet.get_balance().unwrap();
        assert!(clean > 4 * COIN && clean < 5 * COIN);

        let err = wallet.select_coins(10 * COIN, 0, false).unwrap_err();
        assert!(err.is_excluded_by_reuse_policy());
        match err {
            Error::InsufficientFunds {
                available,
                reason: InsufficientFundsReason::ExcludedByReusePolicy { excluded },
                ..
            } => {
                assert_eq!(available, clean);
                assert_eq!(excluded, 10 * COIN);
            }
            _ => panic!("unexpected error"),
        }

        // the same request goes through once dirty outputs are allowed
        let selection = wallet.select_coins(10 * COIN, 0, true).unwrap();
        assert!(selection.selected_amount() >= 10 * COIN);

        // too much even with the dirty outputs
        let err = wallet.select_coins(20 * COIN, 0, true).unwrap_err();
        assert!(matches!(
            err,
            Error::InsufficientFunds {
                reason: InsufficientFundsReason::NotEnoughFunds,
                ..
            }
        ));
        let err = wallet.select_coins(20 * COIN, 0, false).unwrap_err();
        assert!(!err.is_excluded_by_reuse_policy());

        assert!(wallet.send_to_address(&destination, 4 * COIN, false).is_ok());
    }

    #[test]
    fn test_failed_send_has_no_side_effects() {
        let wallet: Wallet<AcceptAll, _> = get_test_wallet(avoid_reuse());
        let script = wallet.get_new_address().unwrap().script_pubkey();
        wallet
            .apply_transaction(&incoming_tx(0, vec![(script.clone(), COIN)]), Some(100))
            .unwrap();
        wallet
            .apply_transaction(&incoming_tx(1, vec![(script, COIN)]), Some(100))
            .unwrap();

        let destination = Address::p2sh(&foreign_script(), Network::Regtest);
        let before_txs = wallet.list_transactions(false).unwrap();
        let before_utxos = wallet.list_unspent().unwrap();
        let before_index = wallet
            .read_db()
            .unwrap()
            .get_last_index(KeychainKind::Internal)
            .unwrap();

        assert!(matches!(
            wallet.send_to_address(&destination, COIN / 2, false),
            Err(Error::InsufficientFunds { .. })
        ));

        assert_eq!(wallet.list_transactions(false).unwrap(), before_txs);
        assert_eq!(wallet.list_unspent().unwrap(), before_utxos);
        assert_eq!(
            wallet
                .read_db()
                .unwrap()
                .get_last_index(KeychainKind::Internal)
                .unwrap(),
            before_index
        );

        // a retry with the override isn't affected by the previous failure
        assert!(wallet.send_to_address(&destination, COIN / 2, true).is_ok());
    }

    #[test]
    fn test_offline_send_leaves_wallet_untouched() {
        let wallet: OfflineWallet<_> = get_test_wallet(WalletConfig::default());
        let script = wallet.get_new_address().unwrap().script_pubkey();
        wallet
            .apply_transaction(&incoming_tx(0, vec![(script, COIN)]), Some(100))
            .unwrap();

        let destination = Address::p2sh(&foreign_script(), Network::Regtest);
        assert!(matches!(
            wallet.send_to_address(&destination, COIN / 2, false),
            Err(Error::OfflineClient)
        ));
        assert_eq!(wallet.get_balance().unwrap(), COIN);
        assert_eq!(wallet.list_transactions(false).unwrap().len(), 1);
    }

    #[test]
    fn test_unconfirmed_self_funding() {
        for count_unconfirmed_funding in &[true, false] {
            let config = WalletConfig {
                avoid_reuse: true,
                count_unconfirmed_funding: *count_unconfirmed_funding,
                ..Default::default()
            };
            let wallet: Wallet<AcceptAll, _> = get_test_wallet(config);
            let address = wallet.get_new_address().unwrap();
            let script = address.script_pubkey();

            wallet
                .apply_transaction(&incoming_tx(0, vec![(script.clone(), COIN)]), Some(100))
                .unwrap();
            wallet
                .apply_transaction(&incoming_tx(1, vec![(foreign_script(), COIN)]), Some(100))
                .unwrap();
            let other = wallet.get_new_address().unwrap();
            wallet
                .apply_transaction(
                    &incoming_tx(2, vec![(other.script_pubkey(), 2 * COIN)]),
                    Some(100),
                )
                .unwrap();

            // pay the first address again from the wallet itself
            let txid = wallet
                .send_to_address(&address, COIN / 2, false)
                .unwrap();

            assert_eq!(
                wallet.reuse_count(&script).unwrap(),
                if *count_unconfirmed_funding { 2 } else { 1 }
            );

            let tx = wallet.list_transactions(true).unwrap();
            let tx = tx.iter().find(|t| t.txid == txid).unwrap();
            wallet
                .apply_transaction(tx.transaction.as_ref().unwrap(), Some(201))
                .unwrap();
            assert_eq!(wallet.reuse_count(&script).unwrap(), 2);
        }
    }

    #[test]
    fn test_foreign_unconfirmed_funding_counts_once_confirmed() {
        let wallet: OfflineWallet<_> = get_test_wallet(avoid_reuse());
        let script = wallet.get_new_address().unwrap().script_pubkey();

        wallet
            .apply_transaction(&incoming_tx(0, vec![(script.clone(), COIN)]), Some(100))
            .unwrap();
        let second = incoming_tx(1, vec![(script.clone(), COIN)]);
        wallet.apply_transaction(&second, None).unwrap();

        assert_eq!(wallet.reuse_count(&script).unwrap(), 1);
        assert_eq!(wallet.get_balance().unwrap(), COIN);

        wallet.apply_transaction(&second, Some(101)).unwrap();
        assert_eq!(wallet.reuse_count(&script).unwrap(), 2);
        assert_eq!(wallet.get_balance().unwrap(), 0);
    }

    #[test]
    fn test_spent_outputs_are_not_resurrected() {
        let wallet: Wallet<AcceptAll, _> = get_test_wallet(WalletConfig::default());
        let script = wallet.get_new_address().unwrap().script_pubkey();
        let funding = incoming_tx(0, vec![(script, COIN)]);
        wallet.apply_transaction(&funding, Some(100)).unwrap();

        let destination = Address::p2sh(&foreign_script(), Network::Regtest);
        wallet
            .send_to_address(&destination, COIN - 10_000, false)
            .unwrap();
        assert!(wallet
            .list_unspent()
            .unwrap()
            .iter()
            .all(|u| u.outpoint.txid != funding.txid()));

        wallet.apply_transaction(&funding, Some(100)).unwrap();
        assert!(wallet
            .list_unspent()
            .unwrap()
            .iter()
            .all(|u| u.outpoint.txid != funding.txid()));
    }

    #[test]
    fn test_concurrent_sends_use_distinct_outputs() {
        let wallet: Arc<Wallet<SlowRelay, _>> =
            Arc::new(get_test_wallet(WalletConfig::default()));
        let script = wallet.get_new_address().unwrap().script_pubkey();
        wallet
            .apply_transaction(&incoming_tx(0, vec![(script, COIN)]), Some(100))
            .unwrap();

        let destination = Address::p2sh(&foreign_script(), Network::Regtest);
        let handles = (0..2)
            .map(|_| {
                let wallet = Arc::clone(&wallet);
                let destination = destination.clone();
                thread::spawn(move || {
                    wallet
                        .send_to_address(&destination, COIN / 10, false)
                        .is_ok()
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            assert!(handle.join().unwrap());
        }

        let sent = wallet.client().sent.lock().unwrap();
        assert_eq!(sent.len(), 2);

        let inputs = sent
            .iter()
            .flat_map(|tx| tx.input.iter().map(|i| i.previous_output))
            .collect::<Vec<_>>();
        assert_eq!(inputs.iter().collect::<HashSet<_>>().len(), inputs.len());

        let change = sent
            .iter()
            .flat_map(|tx| tx.output.iter())
            .filter(|o| o.script_pubkey != destination.script_pubkey())
            .map(|o| o.script_pubkey.clone())
            .collect::<Vec<_>>();
        assert_eq!(change.len(), 2);
        assert_ne!(change[0], change[1]);
        for script in &change {
            assert_eq!(wallet.reuse_count(script).unwrap(), 1);
        }
    }

    #[test]
    fn test_selection_amount_overflow() {
        let wallet: OfflineWallet<_> = get_test_wallet(WalletConfig::default());
        let script = wallet.get_new_address().unwrap().script_pubkey();
        wallet
            .apply_transaction(&incoming_tx(0, vec![(script, COIN)]), Some(100))
            .unwrap();

        match wallet.select_coins(u64::MAX, 1, false) {
            Err(Error::InsufficientFunds {
                available, reason, ..
            }) => {
                assert_eq!(available, COIN);
                assert_eq!(reason, InsufficientFundsReason::NotEnoughFunds);
            }
            other => panic!("unexpected result {:?}", other.map(|_| ())),
        }
        assert!(matches!(
            wallet.select_coins(u64::MAX - 1_000, 0, false),
            Err(Error::InsufficientFunds { .. })
        ));

        let half = u64::MAX / 2 + 1;
        assert!(matches!(
            wallet.create_tx(TxBuilder::with_recipients(vec![
                (foreign_script(), half),
                (foreign_script(), half),
            ])),
            Err(Error::InsufficientFunds {
                reason: InsufficientFundsReason::NotEnoughFunds,
                ..
            })
        ));
    }

    #[test]
    fn test_failed_commit_keeps_change_index() {
        let secp = Secp256k1::new();
        let xprv = ExtendedPrivKey::new_master(Network::Regtest, &[0x42; 32]).unwrap();
        let xpub = ExtendedPubKey::from_private(&secp, &xprv);

        let database = FlakyDatabase::default();
        let fail_commit = Arc::clone(&database.fail_commit);
        let wallet: OfflineWallet<_> =
            Wallet::new_offline(xpub, None, WalletConfig::default(), database).unwrap();
        wallet.set_current_height(200).unwrap();

        let script = wallet.get_new_address().unwrap().script_pubkey();
        wallet
            .apply_transaction(&incoming_tx(0, vec![(script, COIN)]), Some(100))
            .unwrap();

        let (tx, _) = wallet
            .create_tx(TxBuilder::with_recipients(vec![(foreign_script(), COIN / 2)]))
            .unwrap();
        let change = tx
            .output
            .iter()
            .find(|o| o.script_pubkey != foreign_script())
            .map(|o| o.script_pubkey.clone())
            .unwrap();

        fail_commit.store(true, Ordering::SeqCst);
        assert!(wallet.commit_tx(&tx).is_err());

        let last_index = |wallet: &OfflineWallet<FlakyDatabase>| {
            wallet
                .read_db()
                .unwrap()
                .get_last_index(KeychainKind::Internal)
                .unwrap()
        };
        assert_eq!(last_index(&wallet), None);
        assert!(!wallet.is_mine(&change).unwrap());
        assert_eq!(wallet.get_balance().unwrap(), COIN);

        fail_commit.store(false, Ordering::SeqCst);
        wallet.commit_tx(&tx).unwrap();
        assert_eq!(last_index(&wallet), Some(0));
        assert!(wallet.is_mine(&change).unwrap());
    }
}
