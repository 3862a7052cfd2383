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

use std::fmt;

use bitcoin::hashes::hex::ToHex;
use bitcoin::{Address, Script};

/// Why a coin selection could not reach its target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsufficientFundsReason {
    /// The wallet doesn't own enough spendable value, dirty outputs included
    NotEnoughFunds,
    /// Enough value exists, but part of it sits on reused destinations and the active policy
    /// keeps those outputs out of the selection
    ExcludedByReusePolicy {
        /// Value (sats) of the dirty outputs that were left out
        excluded: u64,
    },
}

/// Errors that can be thrown by the [`Wallet`](crate::wallet::Wallet)
#[derive(Debug)]
pub enum Error {
    /// Wrong number of bytes found when trying to convert to u32
    InvalidU32Bytes(Vec<u8>),
    /// Generic error
    Generic(String),
    /// Cannot build a tx without recipients
    NoRecipients,
    /// Output created is under the dust limit, 546 satoshis
    OutputBelowDustLimit(usize),
    /// Wallet's UTXO set is not enough to cover recipient's requested plus fee
    InsufficientFunds {
        /// Sats needed for the transaction
        needed: u64,
        /// Sats available for spending under the active policy
        available: u64,
        /// Whether the reuse policy is what made the selection fail
        reason: InsufficientFundsReason,
    },
    /// Branch and bound coin selection possible attempts with sufficiently big UTXO set could grow
    /// exponentially, thus a limit is set, and when hit, this error is thrown
    BnBTotalTriesExceeded,
    /// Branch and bound coin selection tries to avoid needing a change by finding the right inputs for
    /// the desired outputs plus fee, if there is not such combination this error is thrown
    BnBNoExactMatch,
    /// The destination is not tracked by this wallet
    UnknownDestination(Script),
    /// Address is for a different network than the wallet
    InvalidAddressNetwork(Address),
    /// The wallet has no blockchain client to broadcast transactions with
    OfflineClient,

    /// Encoding error
    Encode(bitcoin::consensus::encode::Error),
    /// BIP32 error
    Bip32(bitcoin::util::bip32::Error),
    /// Error parsing a decimal amount
    Amount(bitcoin::util::amount::ParseAmountError),
    /// Error serializing or deserializing JSON data
    Json(serde_json::Error),
    #[cfg(feature = "key-value-db")]
    /// Sled database error
    Sled(sled::Error),
}

impl Error {
    /// Whether this error is an [`Error::InsufficientFunds`] caused by the reuse policy
    pub fn is_excluded_by_reuse_policy(&self) -> bool {
        matches!(
            self,
            Error::InsufficientFunds {
                reason: InsufficientFundsReason::ExcludedByReusePolicy { .. },
                ..
            }
        )
    }
}

impl fmt::Display for InsufficientFundsReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotEnoughFunds => write!(f, "not enough spendable funds"),
            Self::ExcludedByReusePolicy { excluded } => write!(
                f,
                "{} sat on reused addresses excluded by the avoid-reuse policy",
                excluded
            ),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidU32Bytes(_) => write!(
                f,
                "Wrong number of bytes found when trying to convert to u32"
            ),
            Self::Generic(err) => write!(f, "Generic error: {}", err),
            Self::NoRecipients => write!(f, "Cannot build tx without recipients"),
            Self::OutputBelowDustLimit(index) => {
                write!(f, "Output #{} below the dust limit", index)
            }
            Self::InsufficientFunds {
                needed,
                available,
                reason,
            } => write!(
                f,
                "Insufficient funds: {} sat available of {} sat needed ({})",
                available, needed, reason
            ),
            Self::BnBTotalTriesExceeded => {
                write!(f, "Branch and bound coin selection: total tries exceeded")
            }
            Self::BnBNoExactMatch => write!(f, "Branch and bound coin selection: not exact match"),
            Self::UnknownDestination(script) => {
                write!(
                    f,
                    "Destination not tracked by this wallet: {}",
                    script.as_bytes().to_hex()
                )
            }
            Self::InvalidAddressNetwork(address) => {
                write!(f, "Address {} is for a different network", address)
            }
            Self::OfflineClient => write!(f, "No blockchain client available"),
            Self::Encode(err) => write!(f, "Encoding error: {}", err),
            Self::Bip32(err) => write!(f, "BIP32 error: {}", err),
            Self::Amount(err) => write!(f, "Invalid amount: {}", err),
            Self::Json(err) => write!(f, "Serialize/Deserialize JSON error: {}", err),
            #[cfg(feature = "key-value-db")]
            Self::Sled(err) => write!(f, "Sled database error: {}", err),
        }
    }
}

impl std::error::Error for Error {}

macro_rules! impl_error {
    ( $from:ty, $to:ident ) => {
        impl_error!($from, $to, Error);
    };
    ( $from:ty, $to:ident, $impl_for:ty ) => {
        impl std::convert::From<$from> for $impl_for {
            fn from(err: $from) -> Self {
                <$impl_for>::$to(err)
            }
        }
    };
}

impl_error!(bitcoin::consensus::encode::Error, Encode);
impl_error!(bitcoin::util::bip32::Error, Bip32);
impl_error!(bitcoin::util::amount::ParseAmountError, Amount);
impl_error!(serde_json::Error, Json);

#[cfg(feature = "key-value-db")]
impl_error!(sled::Error, Sled);
