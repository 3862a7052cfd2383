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

//! Wallet configuration
//!
//! The configuration is fixed when a [`Wallet`](crate::Wallet) is created and travels with it:
//! two wallets in the same process can run with different policies.

use bitcoin::Network;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::types::FeeRate;

/// Node-level wallet options
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct WalletConfig {
    /// Network the wallet operates on
    #[serde(with = "network_name")]
    pub network: Network,
    /// Keep outputs on reused destinations out of the default balance and coin selection
    pub avoid_reuse: bool,
    /// Count unconfirmed funding transactions created by this wallet toward address reuse.
    ///
    /// Confirmed funding always counts, unconfirmed funding from other wallets never does.
    pub count_unconfirmed_funding: bool,
    /// Fee rate used by [`Wallet::send_to_address`](crate::Wallet::send_to_address)
    pub fee_rate: FeeRate,
}

impl Default for WalletConfig {
    fn default() -> Self {
        WalletConfig {
            network: Network::Regtest,
            avoid_reuse: false,
            count_unconfirmed_funding: true,
            fee_rate: FeeRate::default_min_relay_fee(),
        }
    }
}

impl WalletConfig {
    /// Parse a configuration from JSON, missing fields take their default value
    pub fn from_json(json: &str) -> Result<Self, Error> {
        Ok(serde_json::from_str(json)?)
    }
}

// `Network` is (de)serialized through its canonical name, e.g. `"regtest"`
mod network_name {
    use std::str::FromStr;

    use bitcoin::Network;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(network: &Network, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&network.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Network, D::Error> {
        let name = String::deserialize(d)?;
        Network::from_str(&name).map_err(de::Error::custom)
    }
}
