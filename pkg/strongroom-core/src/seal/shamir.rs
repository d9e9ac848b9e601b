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

use zeroize::Zeroizing;

/// The root key is split into shares held by operators.
#[derive(Debug, Default, Clone, Copy)]
pub struct ShamirSeal;

impl ShamirSeal {
    pub const TYPE: &'static str = "shamir";
}

impl SealBackend for ShamirSeal {
    fn seal_type(&self) -> String {
        Self::TYPE.to_string()
    }

    fn auto_unseal(&self) -> bool {
        false
    }

    fn wrap_root_key(&self, _plaintext: &[u8]) -> Result<Vec<u8>, Error> {
        Err(Error::Unsupported(self.seal_type()))
    }

    fn unwrap_root_key(&self, _blob: &[u8]) -> Result<Zeroizing<Vec<u8>>, Error> {
        Err(Error::Unsupported(self.seal_type()))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn cannot_wrap() {
        let seal = ShamirSeal;
        assert_eq!(seal.seal_type(), "shamir");
        assert!(!seal.auto_unseal());
        assert!(!seal.stored_shares_supported());
        assert!(matches!(
            seal.wrap_root_key(b"key"),
            Err(Error::Unsupported(_))
        ));
        assert!(matches!(
            seal.unwrap_root_key(b"blob"),
            Err(Error::Unsupported(_))
        ));
    }
}
