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

use crate::barrier::{generate_key, Error, KEY_LENGTH};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Store key bytes as base64 strings rather than JSON arrays of numbers.
mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use serde::{de::Error, Deserialize, Deserializer, Serializer};
    use zeroize::Zeroizing;

    pub(super) fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&Zeroizing::new(BASE64.encode(bytes)))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded = Zeroizing::new(String::deserialize(d)?);
        BASE64.decode(encoded.as_bytes()).map_err(D::Error::custom)
    }
}

/// A single barrier encryption key.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub(crate) struct Key {
    pub(crate) term: u32,
    #[serde(with = "base64_bytes")]
    pub(crate) value: Vec<u8>,
    #[zeroize(skip)]
    pub(crate) install_time: DateTime<Utc>,
}

impl Key {
    fn new(term: u32, value: &[u8]) -> Self {
        Self {
            term,
            value: value.to_vec(),
            install_time: Utc::now(),
        }
    }
}

/// Public information about a barrier key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct KeyInfo {
    pub term: u32,
    pub install_time: DateTime<Utc>,
}

/// The set of barrier keys, together with the root key that wraps them.
///
/// Keeping the root key inside the (root-key-encrypted) keyring is what lets
/// the barrier tell a correct root key apart from one that only happens to
/// authenticate: after decryption the embedded copy has to match.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub(crate) struct Keyring {
    #[serde(with = "base64_bytes")]
    root_key: Vec<u8>,
    keys: Vec<Key>,
    active_term: u32,
}

impl Keyring {
    /// Create a keyring with a freshly generated key at term 1.
    pub(crate) fn new(root_key: &[u8]) -> Result<Self, Error> {
        check_key_length(root_key)?;
        Ok(Self {
            root_key: root_key.to_vec(),
            keys: vec![Key::new(1, &generate_key())],
            active_term: 1,
        })
    }

    pub(crate) fn root_key(&self) -> &[u8] {
        &self.root_key
    }

    pub(crate) fn root_key_matches(&self, candidate: &[u8]) -> bool {
        self.root_key.ct_eq(candidate).into()
    }

    pub(crate) fn active_term(&self) -> u32 {
        self.active_term
    }

    pub(crate) fn active_key(&self) -> Result<&Key, Error> {
        self.term_key(self.active_term)
    }

    pub(crate) fn term_key(&self, term: u32) -> Result<&Key, Error> {
        self.keys
            .iter()
            .find(|key| key.term == term)
            .ok_or(Error::UnknownTerm(term))
    }

    pub(crate) fn key_info(&self) -> Vec<KeyInfo> {
        self.keys
            .iter()
            .map(|key| KeyInfo {
                term: key.term,
                install_time: key.install_time,
            })
            .collect()
    }

    /// Return a copy of the keyring with `value` installed as the new active
    /// key, one term after the current one.
    pub(crate) fn rotate(&self, value: &[u8]) -> Result<Self, Error> {
        check_key_length(value)?;
        let term = self
            .active_term
            .checked_add(1)
            .ok_or(Error::UnknownTerm(self.active_term))?;
        let mut rotated = self.clone();
        rotated.keys.push(Key::new(term, value));
        rotated.active_term = term;
        Ok(rotated)
    }

    /// Return a copy of the keyring wrapped by a different root key. The
    /// barrier keys themselves are unchanged.
    pub(crate) fn with_root_key(&self, root_key: &[u8]) -> Result<Self, Error> {
        check_key_length(root_key)?;
        let mut rekeyed = self.clone();
        rekeyed.root_key.zeroize();
        rekeyed.root_key = root_key.to_vec();
        Ok(rekeyed)
    }

    pub(crate) fn serialize(&self) -> Result<Zeroizing<Vec<u8>>, Error> {
        Ok(Zeroizing::new(serde_json::to_vec(self)?))
    }

    pub(crate) fn deserialize(bytes: &[u8]) -> Result<Self, Error> {
        let keyring: Self = serde_json::from_slice(bytes)?;
        check_key_length(&keyring.root_key)?;
        if keyring.keys.iter().any(|key| key.value.len() != KEY_LENGTH) {
            return Err(Error::InvalidKeyLength(KEY_LENGTH));
        }
        keyring.active_key()?;
        Ok(keyring)
    }
}

pub(crate) fn check_key_length(key: &[u8]) -> Result<(), Error> {
    match key.len() {
        KEY_LENGTH => Ok(()),
        _ => Err(Error::InvalidKeyLength(KEY_LENGTH)),
    }
}
