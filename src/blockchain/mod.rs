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

//! Blockchain backends
//!
//! The wallet doesn't follow the chain by itself: whoever syncs it feeds confirmed and mempool
//! transactions through [`Wallet::apply_transaction`](crate::Wallet::apply_transaction). The
//! only thing it needs from a backend is a way to push the transactions it creates to the
//! network, which is what the [`Blockchain`] trait describes.

use std::ops::Deref;
use std::sync::Arc;

use bitcoin::Transaction;

use crate::error::Error;

/// Trait that defines the actions that must be supported by a blockchain backend
pub trait Blockchain {
    /// Return whether or not the client has the ability to fullfill requests
    ///
    /// This should always be `false` for offline-only types, and can be true for online types
    /// that have a network connection.
    fn is_online(&self) -> bool;

    /// Create a new instance of the client that is offline-only
    fn offline() -> Self;

    /// Broadcast a transaction
    fn broadcast(&self, tx: &Transaction) -> Result<(), Error>;
}

/// Type that only implements [`Blockchain`] and is always offline
pub struct OfflineBlockchain;

impl Blockchain for OfflineBlockchain {
    fn offline() -> Self {
        OfflineBlockchain
    }

    fn is_online(&self) -> bool {
        false
    }

    fn broadcast(&self, _tx: &Transaction) -> Result<(), Error> {
        Err(Error::OfflineClient)
    }
}

impl<T: Blockchain> Blockchain for Arc<T> {
    fn is_online(&self) -> bool {
        self.deref().is_online()
    }

    fn offline() -> Self {
        Arc::new(T::offline())
    }

    fn broadcast(&self, tx: &Transaction) -> Result<(), Error> {
        self.deref().broadcast(tx)
    }
}
