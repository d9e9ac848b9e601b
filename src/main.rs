/*
 * strongroom: sealed key management for an encrypted secrets barrier
 * Copyright (C) 2018-2022 Aleksa Sarai <cyphar@cyphar.com>
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

mod ceremony;

use std::{
    error::Error as StdError,
    io::{self, prelude::*},
    sync::Arc,
};

use anyhow::{anyhow, Context, Error};
use clap::{Arg, ArgAction, ArgMatches, Command};
use tracing_subscriber::EnvFilter;

extern crate strongroom_core;
use strongroom_core::{
    decode_root_token,
    seal::{KmsSeal, LocalKms, SealBackend, ShamirSeal},
    storage::FileStorage,
    GenerateRootCoordinator, IssuedShare, RekeyCoordinator, RootTokenMode, SealConfig,
    SealManager,
};

fn open(matches: &ArgMatches) -> Result<Arc<SealManager>, Error> {
    let storage_dir = matches
        .get_one::<String>("storage-dir")
        .context("required --storage-dir argument not provided")?;
    let storage = FileStorage::new(storage_dir)
        .with_context(|| format!("failed to open storage directory '{}'", storage_dir))?;

    let seal: Arc<dyn SealBackend> = match matches.get_one::<String>("kms-key-file") {
        Some(path) => {
            let kms = LocalKms::load_or_create(path)
                .with_context(|| format!("failed to load kms key '{}'", path))?;
            Arc::new(KmsSeal::new(Arc::new(kms)))
        }
        None => Arc::new(ShamirSeal),
    };
    Ok(Arc::new(SealManager::new(Arc::new(storage), seal)))
}

fn parse_count(matches: &ArgMatches, name: &str) -> Result<usize, Error> {
    matches
        .get_one::<String>(name)
        .with_context(|| format!("required --{} argument not provided", name))?
        .parse()
        .with_context(|| format!("--{} argument was not an unsigned integer", name))
}

fn shares_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("shares")
                .short('n')
                .long("shares")
                .value_name("SHARES")
                .help("Number of unseal keys to split the root key into.")
                .action(ArgAction::Set)
                .required(true),
        )
        .arg(
            Arg::new("threshold")
                .short('t')
                .long("threshold")
                .value_name("THRESHOLD")
                .help("Number of unseal keys required to reconstruct the root key (must not be larger than --shares).")
                .action(ArgAction::Set)
                .required(true),
        )
}

fn print_shares(shares: &[String]) {
    for (idx, share) in shares.iter().enumerate() {
        println!("Unseal key {}: {}", idx + 1, share);
    }
}

// strongroom init -n <SHARES> -t <THRESHOLD> [--stored-shares <N>]
fn init_cli() -> Command {
    shares_args(Command::new("init").about("Initialize the storage and print the unseal keys."))
        .arg(
            Arg::new("stored-shares")
                .long("stored-shares")
                .value_name("N")
                .help("Number of unseal keys to keep wrapped by the kms instead of printing them (requires --kms-key-file).")
                .action(ArgAction::Set)
                .default_value("0"),
        )
}

fn init(manager: &SealManager, matches: &ArgMatches) -> Result<(), Error> {
    let config = SealConfig {
        stored_shares: parse_count(matches, "stored-shares")?,
        ..SealConfig::new(
            parse_count(matches, "shares")?,
            parse_count(matches, "threshold")?,
        )
    };
    let result = manager
        .initialize(&config)
        .context("failed to initialize")?;

    let shares = result
        .shares
        .iter()
        .map(IssuedShare::encoded)
        .collect::<Vec<_>>();
    print_shares(&shares);
    println!();
    println!(
        "Initialized with {} unseal keys and a threshold of {}.",
        config.secret_shares, config.secret_threshold
    );
    if config.stored_shares > 0 {
        println!("{} unseal keys are stored by the seal.", config.stored_shares);
    }
    println!("The unseal keys are not stored anywhere else. Keep them safe.");
    Ok(())
}

// strongroom status
fn status_cli() -> Command {
    Command::new("status").about("Print the seal status.")
}

fn status(manager: &SealManager) -> Result<(), Error> {
    let status = manager.status()?;
    println!("Seal type:    {}", status.seal_type);
    println!("Initialized:  {}", status.initialized);
    println!("Sealed:       {}", status.sealed);
    println!("Total shares: {}", status.shares);
    println!("Threshold:    {}", status.threshold);
    println!("Version:      {}", status.version);
    if status.rekey_interrupted {
        println!("A rekey was interrupted before it completed.");
    }
    Ok(())
}

// strongroom get <KEY>
fn get_cli() -> Command {
    Command::new("get")
        .about("Print a value stored in the barrier.")
        .arg(
            Arg::new("KEY")
                .help("Path of the value.")
                .action(ArgAction::Set)
                .required(true)
                .index(1),
        )
}

fn get(manager: &SealManager, matches: &ArgMatches) -> Result<(), Error> {
    let key = matches
        .get_one::<String>("KEY")
        .context("required KEY argument not provided")?;
    ceremony::unseal(manager)?;
    let value = manager
        .barrier()
        .get(key)
        .with_context(|| format!("failed to read '{}'", key))?
        .ok_or_else(|| anyhow!("no value stored at '{}'", key))?;
    io::stdout().write_all(&value)?;
    Ok(())
}

// strongroom put <KEY> <VALUE>
fn put_cli() -> Command {
    Command::new("put")
        .about("Store a value in the barrier.")
        .arg(
            Arg::new("KEY")
                .help("Path to store the value at.")
                .action(ArgAction::Set)
                .required(true)
                .index(1),
        )
        .arg(
            Arg::new("VALUE")
                .help(r#"Value to store ("-" to read from stdin)."#)
                .action(ArgAction::Set)
                .allow_hyphen_values(true)
                .required(true)
                .index(2),
        )
}

fn put(manager: &SealManager, matches: &ArgMatches) -> Result<(), Error> {
    let key = matches
        .get_one::<String>("KEY")
        .context("required KEY argument not provided")?;
    let value = matches
        .get_one::<String>("VALUE")
        .context("required VALUE argument not provided")?;
    // Read the value before prompting for unseal keys on the same stdin.
    let value = match value.as_str() {
        "-" => {
            let mut buffer = Vec::new();
            io::stdin()
                .read_to_end(&mut buffer)
                .context("failed to read value from stdin")?;
            buffer
        }
        value => value.as_bytes().to_vec(),
    };
    ceremony::unseal(manager)?;
    manager
        .barrier()
        .put(key, &value)
        .with_context(|| format!("failed to write '{}'", key))?;
    Ok(())
}

// strongroom list [PREFIX]
fn list_cli() -> Command {
    Command::new("list")
        .about("List the keys under a prefix.")
        .arg(
            Arg::new("PREFIX")
                .help("Prefix to list (must end with '/').")
                .action(ArgAction::Set)
                .default_value("")
                .index(1),
        )
}

fn list(manager: &SealManager, matches: &ArgMatches) -> Result<(), Error> {
    let prefix = matches
        .get_one::<String>("PREFIX")
        .context("PREFIX argument not provided")?;
    ceremony::unseal(manager)?;
    for key in manager.barrier().list(prefix)? {
        println!("{}", key);
    }
    Ok(())
}

// strongroom rotate
fn rotate_cli() -> Command {
    Command::new("rotate").about("Install a new barrier key for future writes.")
}

fn rotate(manager: &SealManager) -> Result<(), Error> {
    ceremony::unseal(manager)?;
    let term = manager.barrier().rotate().context("failed to rotate")?;
    println!("Barrier key rotated, new term is {}.", term);
    Ok(())
}

// strongroom rekey -n <SHARES> -t <THRESHOLD> [--verify]
fn rekey_cli() -> Command {
    shares_args(
        Command::new("rekey").about("Replace the root key and print the new unseal keys."),
    )
    .arg(
        Arg::new("verify")
            .long("verify")
            .help("Require a quorum of the new unseal keys before switching to them.")
            .action(ArgAction::SetTrue),
    )
}

fn rekey(manager: &Arc<SealManager>, matches: &ArgMatches) -> Result<(), Error> {
    let config = SealConfig {
        verification_required: matches.get_flag("verify"),
        ..SealConfig::new(
            parse_count(matches, "shares")?,
            parse_count(matches, "threshold")?,
        )
    };
    ceremony::unseal(manager)?;

    let coordinator = RekeyCoordinator::new(Arc::clone(manager));
    let nonce = coordinator
        .init(config)
        .context("failed to start rekey")?;
    let result = ceremony::rekey(&coordinator, &nonce)?;
    print_shares(&result.keys);
    println!();

    if let Some(verification_nonce) = result.verification_nonce {
        println!("Enter a quorum of the new unseal keys to finish the rekey.");
        ceremony::verify_rekey(&coordinator, &verification_nonce)?;
    }
    println!("Root key replaced, the old unseal keys no longer work.");
    Ok(())
}

// strongroom generate-root [--decode <TOKEN> --otp <OTP>]
fn generate_root_cli() -> Command {
    Command::new("generate-root")
        .about("Generate a new root credential, authorized by a quorum of unseal keys.")
        .arg(
            Arg::new("decode")
                .long("decode")
                .value_name("TOKEN")
                .help("Decode an encoded root token instead of generating one.")
                .action(ArgAction::Set)
                .requires("otp"),
        )
        .arg(
            Arg::new("otp")
                .long("otp")
                .value_name("OTP")
                .help("One-time pad the token was encoded with.")
                .action(ArgAction::Set)
                .requires("decode"),
        )
}

fn generate_root(manager: &Arc<SealManager>, matches: &ArgMatches) -> Result<(), Error> {
    if let Some(encoded) = matches.get_one::<String>("decode") {
        let otp = matches
            .get_one::<String>("otp")
            .context("--decode requires --otp")?;
        let token = decode_root_token(encoded, otp).context("failed to decode root token")?;
        println!("{}", *token);
        return Ok(());
    }

    ceremony::unseal(manager)?;
    let coordinator = GenerateRootCoordinator::new(Arc::clone(manager));
    let init = coordinator
        .init(RootTokenMode::Otp)
        .context("failed to start root generation")?;
    let result = ceremony::generate_root(&coordinator, &init.nonce)?;

    println!(
        "Encoded root token: {}",
        result.encoded_token.unwrap_or_default()
    );
    println!("One-time pad:       {}", init.otp.unwrap_or_default());
    println!();
    println!("Decode the token with 'strongroom generate-root --decode <TOKEN> --otp <OTP>'.");
    Ok(())
}

fn cli() -> Command {
    Command::new("strongroom")
        .version("0.0.0")
        .author("Aleksa Sarai <cyphar@cyphar.com>")
        .about("Operate on a sealed strongroom barrier using a basic CLI interface.")
        .arg(
            Arg::new("storage-dir")
                .long("storage-dir")
                .value_name("DIR")
                .help("Directory holding the encrypted storage.")
                .action(ArgAction::Set)
                .global(true)
                .default_value("strongroom-data"),
        )
        .arg(
            Arg::new("kms-key-file")
                .long("kms-key-file")
                .value_name("FILE")
                .help("Auto-unseal using a local kms key stored in FILE (created if missing).")
                .action(ArgAction::Set)
                .global(true),
        )
        // strongroom init -n <SHARES> -t <THRESHOLD> [--stored-shares <N>]
        .subcommand(init_cli())
        // strongroom status
        .subcommand(status_cli())
        // strongroom get <KEY>
        .subcommand(get_cli())
        // strongroom put <KEY> <VALUE>
        .subcommand(put_cli())
        // strongroom list [PREFIX]
        .subcommand(list_cli())
        // strongroom rotate
        .subcommand(rotate_cli())
        // strongroom rekey -n <SHARES> -t <THRESHOLD> [--verify]
        .subcommand(rekey_cli())
        // strongroom generate-root [--decode <TOKEN> --otp <OTP>]
        .subcommand(generate_root_cli())
}

fn main() -> Result<(), Box<dyn StdError>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    let mut app = cli();
    let matches = app.get_matches_mut();

    let ret = match matches.subcommand() {
        Some((subcommand, sub_matches)) => {
            let manager = open(sub_matches)?;
            match subcommand {
                "init" => init(&manager, sub_matches),
                "status" => status(&manager),
                "get" => get(&manager, sub_matches),
                "put" => put(&manager, sub_matches),
                "list" => list(&manager, sub_matches),
                "rotate" => rotate(&manager),
                "rekey" => rekey(&manager, sub_matches),
                "generate-root" => generate_root(&manager, sub_matches),
                _ => {
                    // We should never end up here.
                    app.print_help()?;
                    Err(anyhow!("unknown subcommand '{}'", subcommand))
                }
            }
        }
        None => {
            app.print_help()?;
            Err(anyhow!("no subcommand specified"))
        }
    }?;

    Ok(ret)
}

#[test]
fn verify_cli() {
    cli().debug_assert();
}
