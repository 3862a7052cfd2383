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

use bitcoin::secp256k1::{All, Secp256k1};
use bitcoin::util::bip32::{ChildNumber, ExtendedPubKey};
use bitcoin::{Address, Network};

use crate::error::Error;

// De-facto standard "dust limit" (even though it should change based on the output type)
const DUST_LIMIT_SATOSHI: u64 = 546;

// Fixed weight of a legacy input without its scriptSig: outpoint, nSequence and the scriptSig
// length byte
pub(crate) const TXIN_BASE_WEIGHT: usize = (32 + 4 + 4 + 1) * 4;

// push(sig + sighash) + push(compressed pubkey)
pub(crate) const P2PKH_SATISFACTION_WEIGHT: usize = (1 + 72 + 1 + 33) * 4;

// Number of confirmations a coinbase output needs before it can be spent
pub(crate) const COINBASE_MATURITY: u32 = 100;

/// Trait to check if a value is below the dust limit
// we implement this trait to make sure we don't mess up the comparison with off-by-one like a <
// instead of a <= etc. The constant value for the dust limit is not public on purpose, to
// encourage the usage of this trait.
pub trait IsDust {
    /// Check whether or not a value is below dust limit
    fn is_dust(&self) -> bool;
}

impl IsDust for u64 {
    fn is_dust(&self) -> bool {
        *self <= DUST_LIMIT_SATOSHI
    }
}

pub(crate) type SecpCtx = Secp256k1<All>;

/// Derive the address at `index` of the chain rooted at `xpub`
pub(crate) fn derive_address(
    secp: &SecpCtx,
    xpub: &ExtendedPubKey,
    index: u32,
    network: Network,
) -> Result<Address, Error> {
    let child = xpub.ckd_pub(secp, ChildNumber::from_normal_idx(index)?)?;

    Ok(Address::p2pkh(&child.public_key, network))
}

/// Number of confirmations of something mined at `height`, `0` if unconfirmed
pub(crate) fn confirmations(height: Option<u32>, current_height: Option<u32>) -> u32 {
    match (height, current_height) {
        (Some(height), Some(tip)) if tip >= height => tip - height + 1,
        (Some(_), _) => 1,
        (None, _) => 0,
    }
}
