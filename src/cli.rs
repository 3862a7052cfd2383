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

//! Command line front end
//!
//! Every subcommand maps to one of the methods handled by [`rpc::dispatch`], so the command
//! line and the RPC interface always agree. The global flags configure the node-level options
//! of the wallet, see [`config_from_matches`].

use std::str::FromStr;

use clap::{App, Arg, ArgMatches, SubCommand};

#[allow(unused_imports)]
use log::{debug, error, info, trace, LevelFilter};

use bitcoin::util::bip32::ExtendedPubKey;
use bitcoin::{Address, Network};

use serde_json::Value;

use crate::blockchain::Blockchain;
use crate::database::BatchDatabase;
use crate::error::Error;
use crate::rpc::{self, RpcError};
use crate::{FeeRate, Wallet, WalletConfig};

fn address_validator(s: String) -> Result<(), String> {
    Address::from_str(&s)
        .map(|_| ())
        .map_err(|e| format!("{:?}", e))
}

fn xpub_validator(s: String) -> Result<(), String> {
    ExtendedPubKey::from_str(&s)
        .map(|_| ())
        .map_err(|e| format!("{:?}", e))
}

fn u64_validator(s: String) -> Result<(), String> {
    u64::from_str(&s).map(|_| ()).map_err(|e| e.to_string())
}

pub fn make_cli_subcommands<'a, 'b>() -> App<'a, 'b> {
    App::new("avoidreuse")
        .version(option_env!("CARGO_PKG_VERSION").unwrap_or("unknown"))
        .author(option_env!("CARGO_PKG_AUTHORS").unwrap_or(""))
        .about("A wallet that keeps track of reused addresses")
        .subcommand(
            SubCommand::with_name("getnewaddress").about("Generates a new external address"),
        )
        .subcommand(
            SubCommand::with_name("getbalance")
                .about("Returns the spendable balance")
                .arg(
                    Arg::with_name("include_dirty")
                        .long("include_dirty")
                        .help("Also count outputs on reused addresses")
                        .takes_value(false),
                ),
        )
        .subcommand(
            SubCommand::with_name("getbalances")
                .about("Returns the balance split by trust and by reuse"),
        )
        .subcommand(
            SubCommand::with_name("listunspent")
                .about("Lists the unspent outputs, flagging the ones on reused addresses"),
        )
        .subcommand(
            SubCommand::with_name("listtransactions")
                .about("Lists all the incoming and outgoing transactions of the wallet"),
        )
        .subcommand(
            SubCommand::with_name("getaddressinfo")
                .about("Shows what the wallet knows about an address")
                .arg(
                    Arg::with_name("address")
                        .value_name("ADDRESS")
                        .required(true)
                        .validator(address_validator),
                ),
        )
        .subcommand(
            SubCommand::with_name("importaddress")
                .about("Tracks an address as watch-only")
                .arg(
                    Arg::with_name("address")
                        .value_name("ADDRESS")
                        .required(true)
                        .validator(address_validator),
                ),
        )
        .subcommand(
            SubCommand::with_name("sendtoaddress")
                .about("Sends an amount to an address")
                .arg(
                    Arg::with_name("address")
                        .value_name("ADDRESS")
                        .required(true)
                        .validator(address_validator),
                )
                .arg(
                    Arg::with_name("amount")
                        .value_name("BTC")
                        .help("Amount in BTC, at most 8 decimal places")
                        .required(true),
                )
                .arg(
                    Arg::with_name("allow_dirty")
                        .long("allow_dirty")
                        .help("Allows spending outputs on reused addresses")
                        .takes_value(false),
                ),
        )
}

pub fn add_global_flags<'a, 'b>(app: App<'a, 'b>) -> App<'a, 'b> {
    app.arg(
        Arg::with_name("network")
            .short("n")
            .long("network")
            .value_name("NETWORK")
            .help("Sets the network")
            .takes_value(true)
            .default_value("regtest")
            .possible_values(&["bitcoin", "testnet", "regtest"]),
    )
    .arg(
        Arg::with_name("xpub")
            .short("x")
            .long("xpub")
            .value_name("XPUB")
            .help("Sets the extended public key to use for the external addresses")
            .required(true)
            .takes_value(true)
            .validator(xpub_validator),
    )
    .arg(
        Arg::with_name("change_xpub")
            .short("c")
            .long("change_xpub")
            .value_name("XPUB")
            .help("Sets the extended public key to use for internal addresses")
            .takes_value(true)
            .validator(xpub_validator),
    )
    .arg(
        Arg::with_name("avoidreuse")
            .long("avoidreuse")
            .help("Keeps outputs on reused addresses out of the balance and of coin selection")
            .takes_value(false),
    )
    .arg(
        Arg::with_name("no_unconfirmed_reuse")
            .long("no-unconfirmed-reuse")
            .help("Only counts confirmed payments when looking for reused addresses")
            .takes_value(false),
    )
    .arg(
        Arg::with_name("fee_rate")
            .long("fee-rate")
            .value_name("SATS_VBYTE")
            .help("Fee rate to use for outgoing transactions")
            .takes_value(true)
            .default_value("1")
            .validator(u64_validator),
    )
    .arg(
        Arg::with_name("v")
            .short("v")
            .multiple(true)
            .help("Sets the level of verbosity"),
    )
}

/// Build the wallet configuration out of the global flags
pub fn config_from_matches(matches: &ArgMatches<'_>) -> Result<WalletConfig, Error> {
    let network = match matches.value_of("network") {
        Some(name) => Network::from_str(name).map_err(|e| Error::Generic(e.to_string()))?,
        None => Network::Regtest,
    };
    let fee_rate = match matches.value_of("fee_rate") {
        Some(rate) => u64::from_str(rate).map_err(|e| Error::Generic(e.to_string()))?,
        None => 1,
    };

    Ok(WalletConfig {
        network,
        avoid_reuse: matches.is_present("avoidreuse"),
        count_unconfirmed_funding: !matches.is_present("no_unconfirmed_reuse"),
        fee_rate: FeeRate::from_sat_per_vb(fee_rate),
    })
}

/// Parse the extended public keys of the external and internal keychains
pub fn xpubs_from_matches(
    matches: &ArgMatches<'_>,
) -> Result<(ExtendedPubKey, Option<ExtendedPubKey>), Error> {
    let parse = |s: &str| -> Result<ExtendedPubKey, Error> {
        ExtendedPubKey::from_str(s).map_err(|e| Error::Generic(e.to_string()))
    };

    let external = matches
        .value_of("xpub")
        .ok_or_else(|| Error::Generic("Missing `xpub`".into()))
        .and_then(parse)?;
    let internal = matches.value_of("change_xpub").map(parse).transpose()?;

    Ok((external, internal))
}

/// Log level requested with the `-v` flag
pub fn log_level(matches: &ArgMatches<'_>) -> LevelFilter {
    match matches.occurrences_of("v") {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

/// Run the subcommand in `matches`, returning its output as pretty-printed JSON
pub fn handle_matches<B, D>(
    wallet: &Wallet<B, D>,
    matches: ArgMatches<'_>,
) -> Result<Option<String>, RpcError>
where
    B: Blockchain,
    D: BatchDatabase,
{
    let (method, params) = match matches.subcommand() {
        ("getbalance", Some(sub_matches)) => (
            "getbalance",
            json!({ "avoid_reuse": !sub_matches.is_present("include_dirty") }),
        ),
        (name, Some(sub_matches)) if name == "getaddressinfo" || name == "importaddress" => (
            name,
            json!({ "address": sub_matches.value_of("address") }),
        ),
        ("sendtoaddress", Some(sub_matches)) => (
            "sendtoaddress",
            json!({
                "address": sub_matches.value_of("address"),
                // amounts are passed as strings to keep their exact decimal form
                "amount": sub_matches.value_of("amount"),
                "allowdirty": sub_matches.is_present("allow_dirty"),
            }),
        ),
        (name, Some(_)) => (name, Value::Null),
        (_, None) => return Ok(None),
    };

    let result = rpc::dispatch(wallet, method, &params)?;
    let output = serde_json::to_string_pretty(&result)
        .map_err(|e| RpcError::new(rpc::RPC_MISC_ERROR, e.to_string()))?;

    Ok(Some(output))
}
