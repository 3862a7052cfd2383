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

//! Interactive shell on top of a sled-backed wallet
//!
//! ```text
//! cargo run --example repl --features cli-utils -- --xpub <XPUB> --avoidreuse repl
//! ```
//!
//! The wallet isn't connected to any node, so `sendtoaddress` fails with an offline error.

use std::fs;
use std::path::PathBuf;

use clap::{AppSettings, SubCommand};

use rustyline::error::ReadlineError;
use rustyline::Editor;

#[allow(unused_imports)]
use log::{debug, error, info, trace, LevelFilter};

use avoidreuse::cli;
use avoidreuse::sled;
use avoidreuse::{OfflineWallet, Wallet};

fn prepare_home_dir() -> PathBuf {
    let mut dir = PathBuf::new();
    dir.push(&dirs_next::home_dir().unwrap());
    dir.push(".avoidreuse");

    if !dir.exists() {
        info!("Creating home directory {}", dir.as_path().display());
        fs::create_dir(&dir).unwrap();
    }

    dir.push("database.sled");
    dir
}

fn run<D: avoidreuse::database::BatchDatabase>(
    wallet: &OfflineWallet<D>,
    matches: clap::ArgMatches<'_>,
) {
    match cli::handle_matches(wallet, matches) {
        Ok(Some(output)) => println!("{}", output),
        Ok(None) => {}
        Err(err) => println!("error {}: {}", err.code, err.message),
    }
}

fn main() {
    let app = cli::make_cli_subcommands();
    let mut repl_app = app.clone().setting(AppSettings::NoBinaryName);

    let app = cli::add_global_flags(app)
        .subcommand(SubCommand::with_name("repl").about("Opens an interactive shell"));
    let matches = app.get_matches();

    env_logger::Builder::new()
        .filter_level(cli::log_level(&matches))
        .init();

    let config = cli::config_from_matches(&matches).unwrap();
    let (external, internal) = cli::xpubs_from_matches(&matches).unwrap();
    debug!("config: {:?}", config);

    let database = sled::open(prepare_home_dir().to_str().unwrap()).unwrap();
    let tree = database.open_tree(external.fingerprint().to_string()).unwrap();
    debug!("database opened successfully");

    let wallet: OfflineWallet<_> = Wallet::new_offline(external, internal, config, tree).unwrap();

    if matches.subcommand_matches("repl").is_some() {
        let mut rl = Editor::<()>::new();

        loop {
            let readline = rl.readline(">> ");
            match readline {
                Ok(line) => {
                    if line.trim() == "" {
                        continue;
                    }
                    rl.add_history_entry(line.as_str());

                    match repl_app.get_matches_from_safe_borrow(line.split_whitespace()) {
                        Ok(matches) => run(&wallet, matches),
                        Err(err) => println!("{}", err.message),
                    }
                }
                Err(ReadlineError::Interrupted) => continue,
                Err(ReadlineError::Eof) => break,
                Err(err) => {
                    println!("{:?}", err);
                    break;
                }
            }
        }
    } else {
        run(&wallet, matches);
    }

    database.flush().unwrap();
}
