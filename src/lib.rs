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

//! A reuse-aware wallet engine.
//!
//! The crate tracks every destination (address) the wallet hands out together with the
//! distinct transactions that funded it. An unspent output whose destination has been funded
//! by more than one transaction is *dirty*: spending it links the two payments together.
//!
//! With the `avoid_reuse` policy turned on in the [`WalletConfig`], the [`Wallet`] keeps dirty
//! outputs out of its default balance and out of coin selection. A send request can still opt
//! into spending them with `allow_dirty`.
//!
//! ## Example
//!
//! ```
//! use avoidreuse::bitcoin::util::bip32::{ExtendedPrivKey, ExtendedPubKey};
//! use avoidreuse::bitcoin::secp256k1::Secp256k1;
//! use avoidreuse::bitcoin::Network;
//! use avoidreuse::database::MemoryDatabase;
//! use avoidreuse::{OfflineWallet, Wallet, WalletConfig};
//!
//! let secp = Secp256k1::new();
//! let xprv = ExtendedPrivKey::new_master(Network::Regtest, &[0x42; 32])?;
//! let xpub = ExtendedPubKey::from_private(&secp, &xprv);
//!
//! let config = WalletConfig {
//!     avoid_reuse: true,
//!     ..Default::default()
//! };
//! let wallet: OfflineWallet<_> =
//!     Wallet::new_offline(xpub, None, config, MemoryDatabase::new())?;
//!
//! let address = wallet.get_new_address()?;
//! assert_eq!(wallet.reuse_count(&address.script_pubkey())?, 0);
//! assert_eq!(wallet.get_balance()?, 0);
//! # Ok::<(), avoidreuse::Error>(())
//! ```

pub extern crate bitcoin;
extern crate log;
extern crate serde;
#[macro_use]
extern crate serde_json;

#[cfg(feature = "key-value-db")]
pub extern crate sled;

#[cfg(feature = "cli-utils")]
pub mod cli;

#[cfg(test)]
#[macro_use]
extern crate lazy_static;

#[macro_use]
pub(crate) mod error;
pub mod blockchain;
pub mod config;
pub mod database;
pub mod rpc;
pub(crate) mod types;
pub mod wallet;

pub use config::WalletConfig;
pub use error::{Error, InsufficientFundsReason};
pub use types::*;
pub use wallet::tx_builder::TxBuilder;
pub use wallet::{OfflineWallet, Wallet};
