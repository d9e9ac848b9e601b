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

//! This package implements a Shamir Secret Sharing scheme in GF(2^8), meaning
//! that every byte of the secret is shared independently (and all x and y
//! values are single bytes).
//!
//! ## Security ##
//! **This implementation has not been reviewed by any cryptographers.** The
//! field arithmetic avoids data-dependent branches, but no stronger
//! constant-time guarantees are made. Callers must authenticate the combined
//! output themselves: combining the wrong shares (or too few of them) yields
//! garbage rather than an error.

mod gf;
mod share;

pub use share::KeyShare;

use gf::{GfElem, GfPolynomial};

use itertools::Itertools;
use rand::{rngs::OsRng, CryptoRng, RngCore};
use zeroize::Zeroizing;

/// Largest number of shares a secret can be split into (there are only 255
/// non-zero x values in GF(2^8)).
pub const MAX_SHARES: usize = 255;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("secret to split must not be empty")]
    EmptySecret,

    #[error("cannot split into {0} shares (must be between 1 and {MAX_SHARES})")]
    InvalidShareCount(usize),

    #[error("threshold {threshold} is invalid for {shares} shares")]
    InvalidThreshold { threshold: usize, shares: usize },

    #[error("no shares provided")]
    NoShares,

    #[error("share is too short to hold a secret")]
    ShareTooShort,

    #[error("all shares must be the same length")]
    InconsistentLength,

    #[error("duplicate share with x value {0}")]
    DuplicateShare(u8),

    #[error("failed to decode share: {0}")]
    ShareDecode(String),

    #[error("lagrange interpolation failed: {0}")]
    LagrangeError(#[from] gf::Error),
}

/// Split `secret` into `shares` pieces, any `threshold` of which can be used
/// with [`combine`] to recover it.
pub fn split(secret: &[u8], shares: usize, threshold: usize) -> Result<Vec<KeyShare>, Error> {
    split_with_rng(&mut OsRng, secret, shares, threshold)
}

pub fn split_with_rng<R: CryptoRng + RngCore + ?Sized>(
    rng: &mut R,
    secret: &[u8],
    shares: usize,
    threshold: usize,
) -> Result<Vec<KeyShare>, Error> {
    if secret.is_empty() {
        return Err(Error::EmptySecret);
    }
    if shares == 0 || shares > MAX_SHARES {
        return Err(Error::InvalidShareCount(shares));
    }
    match (shares, threshold) {
        // A single share is just the secret.
        (1, 1) => {
            tracing::warn!("splitting secret into a single share, the share is the secret");
            return Ok(vec![KeyShare::from_bytes(secret.to_vec())]);
        }
        (_, t) if t < 2 || t > shares => {
            return Err(Error::InvalidThreshold { threshold, shares })
        }
        _ => (),
    }

    let mut outputs = (1..=shares)
        .map(|_| Zeroizing::new(Vec::with_capacity(secret.len() + 1)))
        .collect::<Vec<_>>();

    for byte in secret {
        let mut poly = GfPolynomial::new_rand(threshold - 1, rng);
        *poly.constant_mut() = GfElem::from_byte(*byte);
        for (idx, output) in outputs.iter_mut().enumerate() {
            let x = GfElem::from_byte((idx + 1) as u8);
            output.push(poly.evaluate(x).to_byte());
        }
    }

    Ok(outputs
        .into_iter()
        .enumerate()
        .map(|(idx, mut output)| {
            output.push((idx + 1) as u8);
            KeyShare::from_bytes(std::mem::take(&mut *output))
        })
        .collect())
}

/// Recover the secret from a set of shares.
///
/// A single share is treated as the output of a 1-of-1 split and returned
/// as-is. There is no way to tell whether enough shares were provided, so
/// the caller has to verify the result.
pub fn combine<S: AsRef<[KeyShare]>>(shares: S) -> Result<Zeroizing<Vec<u8>>, Error> {
    let shares = shares.as_ref();
    let first = match shares {
        [] => return Err(Error::NoShares),
        [only] => return Ok(Zeroizing::new(only.as_bytes().to_vec())),
        [first, ..] => first,
    };

    let len = first.len();
    if len < 2 {
        return Err(Error::ShareTooShort);
    }
    if shares.iter().any(|s| s.len() != len) {
        return Err(Error::InconsistentLength);
    }
    if let Some(x) = shares.iter().filter_map(KeyShare::x).duplicates().next() {
        return Err(Error::DuplicateShare(x));
    }

    let xs = shares
        .iter()
        .filter_map(KeyShare::x)
        .map(GfElem::from_byte)
        .collect::<Vec<_>>();

    let mut secret = Zeroizing::new(Vec::with_capacity(len - 1));
    let mut points = Vec::with_capacity(shares.len());
    for idx in 0..len - 1 {
        points.clear();
        points.extend(
            xs.iter()
                .zip(shares)
                .map(|(x, share)| (*x, GfElem::from_byte(share.ys()[idx]))),
        );
        secret.push(GfPolynomial::lagrange_constant(points.as_slice())?.to_byte());
    }
    Ok(secret)
}
