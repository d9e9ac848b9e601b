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

use crate::shamir::Error;

use std::{fmt, str::FromStr};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Piece of a secret which has been split with [Shamir Secret Sharing][sss].
///
/// The encoding is the per-byte y values followed by a single trailing byte
/// holding the x value, so a share is always one byte longer than the
/// secret it was dealt from. The only exception is the degenerate 1-of-1
/// split, where the "share" is the secret itself.
///
/// The bytes are wiped when the share is dropped.
///
/// [sss]: https://en.wikipedia.org/wiki/Shamir%27s_Secret_Sharing
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KeyShare(Vec<u8>);

impl KeyShare {
    pub fn from_bytes<B: Into<Vec<u8>>>(bytes: B) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The x coordinate this share was evaluated at.
    pub fn x(&self) -> Option<u8> {
        self.0.last().copied()
    }

    /// The y values, one per byte of the secret.
    pub(crate) fn ys(&self) -> &[u8] {
        match self.0.split_last() {
            Some((_, ys)) => ys,
            None => &[],
        }
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(&self.0)
    }
}

impl FromStr for KeyShare {
    type Err = Error;

    /// Parse a share given either as hex or as standard base64.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::ShareDecode("share is empty".into()));
        }
        hex::decode(s)
            .or_else(|_| BASE64.decode(s))
            .map(Self)
            .map_err(|_| Error::ShareDecode("share is neither hex nor base64".into()))
    }
}

impl PartialEq for KeyShare {
    fn eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl Eq for KeyShare {}

impl fmt::Debug for KeyShare {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyShare")
            .field("len", &self.0.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
impl quickcheck::Arbitrary for KeyShare {
    fn arbitrary(g: &mut quickcheck::Gen) -> Self {
        let mut bytes = Vec::<u8>::arbitrary(g);
        bytes.push(u8::arbitrary(g));
        Self(bytes)
    }
}
