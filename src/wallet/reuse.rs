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

//! Address reuse classification
//!
//! A destination is *reused* once more than one distinct transaction has funded it. Every
//! unspent output sitting on a reused destination is *dirty*, including outputs that were clean
//! when they were received.
//!
//! Nothing computed here is ever written back to the database: the [`ReuseClassifier`] reads the
//! funding events stored in the ledger and derives the answer on each call, so a funding event
//! recorded later is reflected by the very next query.

use std::collections::HashMap;

use bitcoin::Script;

use crate::database::Database;
use crate::error::Error;
use crate::types::{FundingEvent, LocalUtxo};

/// Read-only view over the funding ledger of a database
#[derive(Debug)]
pub struct ReuseClassifier<'a, D> {
    database: &'a D,
    count_unconfirmed: bool,
}

impl<'a, D: Database> ReuseClassifier<'a, D> {
    /// Create a classifier over `database`.
    ///
    /// `count_unconfirmed` controls whether unconfirmed funding transactions created by the
    /// wallet itself are counted.
    pub fn new(database: &'a D, count_unconfirmed: bool) -> Self {
        ReuseClassifier {
            database,
            count_unconfirmed,
        }
    }

    /// Whether a funding event takes part in reuse counting
    pub fn is_visible(&self, event: &FundingEvent) -> bool {
        event.is_confirmed() || (self.count_unconfirmed && event.is_own)
    }

    /// Number of distinct visible funding events of `script`
    pub fn reuse_count(&self, script: &Script) -> Result<usize, Error> {
        Ok(self
            .database
            .iter_funding(Some(script))?
            .iter()
            .filter(|e| self.is_visible(e))
            .count())
    }

    /// Whether `utxo` sits on a reused destination
    pub fn is_dirty(&self, utxo: &LocalUtxo) -> Result<bool, Error> {
        Ok(self.reuse_count(&utxo.txout.script_pubkey)? > 1)
    }

    /// Reuse count of every funded destination, computed with a single pass over the ledger
    pub fn reuse_counts(&self) -> Result<ReuseCounts, Error> {
        let mut counts = HashMap::new();
        for event in self.database.iter_funding(None)? {
            if self.is_visible(&event) {
                *counts.entry(event.script_pubkey).or_insert(0) += 1;
            }
        }

        Ok(ReuseCounts(counts))
    }
}

/// Snapshot of the reuse counts of a ledger
#[derive(Debug, Default)]
pub struct ReuseCounts(HashMap<Script, usize>);

impl ReuseCounts {
    /// Reuse count of `script`, `0` if it was never funded
    pub fn get(&self, script: &Script) -> usize {
        self.0.get(script).copied().unwrap_or(0)
    }

    /// Whether `utxo` sits on a reused destination
    pub fn is_dirty(&self, utxo: &LocalUtxo) -> bool {
        self.get(&utxo.txout.script_pubkey) > 1
    }
}
