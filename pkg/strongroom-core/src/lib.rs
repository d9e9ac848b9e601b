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

//! Sealed key management for an encrypted storage barrier.
//!
//! Every value is encrypted by the [`barrier::Barrier`] with a keyring that
//! is itself wrapped by a root key. The root key is never stored. Instead it
//! is split into key shares with [Shamir Secret Sharing](shamir) and handed
//! to operators, who have to bring a quorum of them together to unseal the
//! barrier ([`SealManager`]), to replace the root key ([`RekeyCoordinator`])
//! or to mint a new root credential ([`GenerateRootCoordinator`]).

#![forbid(unsafe_code)]

#[cfg(test)]
extern crate quickcheck;
#[cfg(test)]
#[macro_use]
extern crate quickcheck_macros;

/// Implementation of Shamir Secret Sharing.
pub mod shamir;

pub mod storage;

pub mod barrier;

pub mod seal;

mod config;
mod error;
mod generate_root;
mod manager;
mod pgp;
mod progress;
mod rekey;

pub use config::SealConfig;
pub use error::Error;
pub use generate_root::{
    decode_root_token, CredentialMinter, GenerateRootCoordinator, GenerateRootInit,
    GenerateRootResult, GenerateRootStatus, RandomTokenMinter, RootTokenMode, OTP_LENGTH,
};
pub use manager::{
    InitResult, SealManager, SealStatus, UnsealRequest, UnsealResult, SEAL_CONFIG_PATH,
    STORED_SHARES_PATH, VERSION, WRAPPED_ROOT_KEY_PATH,
};
pub use pgp::{IssuedShare, PgpError, ShareBackup, ShareEncryptor};
pub use rekey::{
    RekeyCoordinator, RekeyResult, RekeyStatus, VerifyResult, REKEY_BACKUP_PATH,
    REKEY_MARKER_PATH,
};
