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

use crate::{barrier, pgp::PgpError, seal, shamir, storage};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid seal configuration: {0}")]
    InvalidConfig(String),

    #[error("missing necessary capabilities to complete request: {0}")]
    MissingCapability(&'static str),

    #[error("already initialized")]
    AlreadyInitialized,

    #[error("not initialized")]
    NotInitialized,

    #[error("already unsealed")]
    AlreadyUnsealed,

    #[error("sealed")]
    Sealed,

    #[error("nonce does not match the operation in progress")]
    NonceMismatch,

    #[error("invalid key share: {0}")]
    InvalidShare(String),

    #[error("unseal keys are incorrect, progress has been reset")]
    IncorrectUnsealKeys,

    #[error("verification shares do not match the new root key, verification progress has been reset")]
    VerificationFailed,

    #[error("a rekey operation is already in progress")]
    RekeyInProgress,

    #[error("no rekey operation is in progress")]
    NoRekeyInProgress,

    #[error("a root generation operation is already in progress")]
    GenerateRootInProgress,

    #[error("no root generation operation is in progress")]
    NoGenerateRootInProgress,

    #[error("operation not valid in the current phase: {0}")]
    InvalidPhase(&'static str),

    #[error("pgp encryption failed: {0}")]
    Pgp(#[from] PgpError),

    #[error("invalid encoded token: {0}")]
    InvalidToken(String),

    #[error("shamir algorithm operation: {0}")]
    Shamir(#[from] shamir::Error),

    #[error("barrier: {0}")]
    Barrier(#[from] barrier::Error),

    #[error("storage: {0}")]
    Storage(#[from] storage::Error),

    #[error("seal: {0}")]
    Seal(#[from] seal::Error),

    #[error("failed to encode {what}: {source}")]
    Serde {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl Error {
    pub(crate) fn serde(what: &'static str) -> impl FnOnce(serde_json::Error) -> Self {
        move |source| Self::Serde { what, source }
    }
}
