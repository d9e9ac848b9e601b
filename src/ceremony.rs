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

//! Interactive key share collection for the CLI. Every ceremony runs inside a
//! single invocation, so nothing is left behind if the process exits.

use std::io::{self, prelude::*};

use anyhow::{anyhow, bail, Context, Error};

use strongroom_core::{
    shamir::KeyShare, Error as CoreError, GenerateRootCoordinator, GenerateRootResult,
    RekeyCoordinator, RekeyResult, SealManager, UnsealRequest, VerifyResult,
};

pub(crate) fn read_oneline<S: AsRef<str>>(prompt: S) -> Result<String, Error> {
    eprint!("{}: ", prompt.as_ref());
    io::stderr().flush()?;

    // The shared stdin buffer keeps piped lines for the following prompts.
    read_line_from(&mut io::stdin().lock())
}

fn read_line_from<R: BufRead>(reader: &mut R) -> Result<String, Error> {
    let mut line = String::new();
    match reader.read_line(&mut line)? {
        0 => Err(anyhow!("no lines read")),
        _ => Ok(line.trim().to_string()),
    }
}

fn read_share<S: AsRef<str>>(prompt: S) -> Result<KeyShare, Error> {
    read_oneline(prompt)?
        .parse()
        .context("failed to parse key share")
}

/// Make sure the barrier is unsealed, asking for unseal keys if the seal
/// cannot do it by itself.
pub(crate) fn unseal(manager: &SealManager) -> Result<(), Error> {
    let status = manager.status()?;
    if !status.initialized {
        bail!("storage has not been initialized (run 'strongroom init' first)");
    }
    if status.rekey_interrupted {
        tracing::warn!("a previous rekey was interrupted, check the unseal keys in use");
    }
    if !status.sealed {
        return Ok(());
    }
    if manager.seal_backend().auto_unseal() {
        return manager.auto_unseal().context("auto-unseal failed");
    }

    let mut nonce = None;
    loop {
        let key = read_oneline(format!(
            "Unseal key ({}/{})",
            manager.status()?.progress + 1,
            status.threshold
        ))?;
        let result = manager
            .unseal(UnsealRequest {
                key: Some(key),
                nonce: nonce.take(),
                reset: false,
            })
            .context("failed to submit unseal key")?;
        if !result.sealed {
            eprintln!("Barrier unsealed.");
            return Ok(());
        }
        nonce = Some(result.nonce);
    }
}

/// Collect current key shares until the rekey produces new ones.
pub(crate) fn rekey(coordinator: &RekeyCoordinator, nonce: &str) -> Result<RekeyResult, Error> {
    loop {
        let status = coordinator.status();
        let share = read_share(format!(
            "Current unseal key ({}/{})",
            status.progress + 1,
            status.required
        ))?;
        let result = coordinator.submit_key(share, nonce)?;
        if !result.keys.is_empty() {
            return Ok(result);
        }
    }
}

/// Collect new key shares until the pending rekey is committed.
pub(crate) fn verify_rekey(
    coordinator: &RekeyCoordinator,
    nonce: &str,
) -> Result<VerifyResult, Error> {
    loop {
        let status = coordinator.status();
        let share = read_share(format!(
            "New unseal key ({}/{})",
            status.verification_progress + 1,
            status.config.map_or(0, |config| config.secret_threshold)
        ))?;
        match coordinator.verify(share, nonce) {
            Ok(result) if result.complete => return Ok(result),
            Ok(_) => (),
            Err(CoreError::VerificationFailed) => {
                eprintln!("New unseal keys did not match, start the verification again.")
            }
            Err(err) => return Err(err.into()),
        }
    }
}

pub(crate) fn generate_root(
    coordinator: &GenerateRootCoordinator,
    nonce: &str,
) -> Result<GenerateRootResult, Error> {
    loop {
        let status = coordinator.status();
        let share = read_share(format!(
            "Unseal key ({}/{})",
            status.progress + 1,
            status.required
        ))?;
        let result = coordinator.submit_key(share, nonce)?;
        if result.complete {
            return Ok(result);
        }
    }
}
