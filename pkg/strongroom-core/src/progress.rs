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

use crate::{
    shamir::{self, KeyShare},
    Error,
};

use uuid::Uuid;
use zeroize::Zeroizing;

/// Shares collected towards a quorum, identified by a random nonce.
///
/// Used by unseal, rekey and root generation alike. Never persisted.
#[derive(Debug)]
pub(crate) struct Quorum {
    nonce: String,
    required: usize,
    share_len: usize,
    shares: Vec<KeyShare>,
}

impl Quorum {
    pub(crate) fn new(required: usize, share_len: usize) -> Self {
        Self {
            nonce: Uuid::new_v4().to_string(),
            required,
            share_len,
            shares: Vec::with_capacity(required),
        }
    }

    /// A quorum for shares of a key with `key_len` bytes, dealt with the
    /// given threshold.
    pub(crate) fn for_key(threshold: usize, key_len: usize) -> Self {
        // A 1-of-1 "share" is the key itself, otherwise there's the x value.
        let share_len = match threshold {
            1 => key_len,
            _ => key_len + 1,
        };
        Self::new(threshold, share_len)
    }

    pub(crate) fn nonce(&self) -> &str {
        &self.nonce
    }

    pub(crate) fn required(&self) -> usize {
        self.required
    }

    pub(crate) fn progress(&self) -> usize {
        self.shares.len()
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.shares.len() >= self.required
    }

    /// A supplied nonce must match. No nonce is accepted.
    pub(crate) fn check_nonce(&self, nonce: Option<&str>) -> Result<(), Error> {
        match nonce {
            Some(nonce) if nonce != self.nonce => Err(Error::NonceMismatch),
            _ => Ok(()),
        }
    }

    /// Add a share, returning whether it was new. Resubmitting a share is
    /// not an error.
    pub(crate) fn add(&mut self, share: KeyShare) -> Result<bool, Error> {
        if share.len() != self.share_len {
            return Err(Error::InvalidShare(format!(
                "expected {} bytes, got {}",
                self.share_len,
                share.len()
            )));
        }
        if self.shares.contains(&share) {
            return Ok(false);
        }
        // Only compare x values for real shares; the 1-of-1 "share" has none.
        if self.required > 1 && self.shares.iter().any(|s| s.x() == share.x()) {
            return Err(shamir::Error::DuplicateShare(share.x().unwrap_or_default()).into());
        }
        if self.is_complete() {
            return Ok(false);
        }
        self.shares.push(share);
        Ok(true)
    }

    pub(crate) fn combine(&self) -> Result<Zeroizing<Vec<u8>>, Error> {
        Ok(shamir::combine(&self.shares)?)
    }

    /// Drop the collected shares but keep the nonce.
    pub(crate) fn reset_shares(&mut self) {
        self.shares.clear();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn nonce_checks() {
        let quorum = Quorum::new(3, 33);
        assert_eq!(quorum.nonce().len(), 36);
        quorum.check_nonce(None).unwrap();
        quorum.check_nonce(Some(quorum.nonce())).unwrap();
        assert!(matches!(
            quorum.check_nonce(Some("other")),
            Err(Error::NonceMismatch)
        ));
        assert_ne!(Quorum::new(3, 33).nonce(), quorum.nonce());
    }

    #[test]
    fn collects_to_threshold() {
        let secret = [7u8; 32];
        let shares = shamir::split(&secret, 5, 3).unwrap();
        let mut quorum = Quorum::for_key(3, secret.len());

        assert!(quorum.add(shares[0].clone()).unwrap());
        assert!(!quorum.add(shares[0].clone()).unwrap());
        assert_eq!(quorum.progress(), 1);
        assert!(quorum.add(shares[3].clone()).unwrap());
        assert!(!quorum.is_complete());
        assert!(quorum.add(shares[4].clone()).unwrap());
        assert!(quorum.is_complete());
        assert_eq!(*quorum.combine().unwrap(), secret);

        // Extra shares past the threshold are ignored.
        assert!(!quorum.add(shares[1].clone()).unwrap());
        assert_eq!(quorum.progress(), 3);

        quorum.reset_shares();
        assert_eq!(quorum.progress(), 0);
        assert_eq!(quorum.required(), 3);
    }

    #[test]
    fn single_share_quorum() {
        let secret = [9u8; 32];
        let shares = shamir::split(&secret, 1, 1).unwrap();
        let mut quorum = Quorum::for_key(1, secret.len());
        assert!(quorum.add(shares[0].clone()).unwrap());
        assert!(quorum.is_complete());
        assert_eq!(*quorum.combine().unwrap(), secret);
    }

    #[test]
    fn rejects_bad_shares() {
        let mut quorum = Quorum::for_key(2, 32);
        assert!(matches!(
            quorum.add(KeyShare::from_bytes(vec![0u8; 10])),
            Err(Error::InvalidShare(_))
        ));

        let a = shamir::split(&[1u8; 32], 3, 2).unwrap();
        let b = shamir::split(&[2u8; 32], 3, 2).unwrap();
        quorum.add(a[0].clone()).unwrap();
        assert!(matches!(
            quorum.add(b[0].clone()),
            Err(Error::Shamir(shamir::Error::DuplicateShare(1)))
        ));
        assert_eq!(quorum.progress(), 1);
    }
}
