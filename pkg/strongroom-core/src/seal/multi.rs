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

use crate::seal::{Error, SealBackend};

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

#[derive(Serialize, Deserialize)]
struct WrappedBlob {
    seal_type: String,
    blob: String,
}

/// Wraps keys with every member seal, so that any one of them can unwrap.
///
/// The wrapped form is a JSON list of `{seal_type, blob}` objects. Unwrapping
/// tries the members in order and returns the first success.
#[derive(Clone)]
pub struct MultiSeal {
    seals: Vec<Arc<dyn SealBackend>>,
}

impl MultiSeal {
    pub const TYPE: &'static str = "multiseal";

    /// Every member must be able to wrap keys.
    pub fn new(seals: Vec<Arc<dyn SealBackend>>) -> Result<Self, Error> {
        if seals.is_empty() || seals.iter().any(|seal| !seal.auto_unseal()) {
            return Err(Error::InvalidMultiSeal);
        }
        Ok(Self { seals })
    }
}

impl SealBackend for MultiSeal {
    fn seal_type(&self) -> String {
        Self::TYPE.to_string()
    }

    fn auto_unseal(&self) -> bool {
        true
    }

    fn wrap_root_key(&self, plaintext: &[u8]) -> Result<Vec<u8>, Error> {
        let blobs = self
            .seals
            .iter()
            .map(|seal| -> Result<WrappedBlob, Error> {
                Ok(WrappedBlob {
                    seal_type: seal.seal_type(),
                    blob: BASE64.encode(seal.wrap_root_key(plaintext)?),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        serde_json::to_vec(&blobs).map_err(|err| Error::MalformedBlob(err.to_string()))
    }

    fn unwrap_root_key(&self, blob: &[u8]) -> Result<Zeroizing<Vec<u8>>, Error> {
        let blobs: Vec<WrappedBlob> =
            serde_json::from_slice(blob).map_err(|err| Error::MalformedBlob(err.to_string()))?;

        for seal in &self.seals {
            let seal_type = seal.seal_type();
            for wrapped in blobs.iter().filter(|b| b.seal_type == seal_type) {
                let raw = match BASE64.decode(&wrapped.blob) {
                    Ok(raw) => raw,
                    Err(err) => {
                        tracing::warn!(
                            seal_type = %seal_type,
                            error = %err,
                            "skipping undecodable wrapped key"
                        );
                        continue;
                    }
                };
                match seal.unwrap_root_key(&raw) {
                    Ok(plaintext) => return Ok(plaintext),
                    Err(err) => tracing::warn!(
                        seal_type = %seal_type,
                        error = %err,
                        "seal failed to unwrap key"
                    ),
                }
            }
        }
        Err(Error::NoSealUnwrapped)
    }
}
