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

use aead::{Aead, KeyInit, Payload};
use chacha20poly1305::ChaCha20Poly1305;
use rand::{rngs::OsRng, RngCore};
use zeroize::Zeroizing;

pub(crate) type ChaChaPolyNonce = aead::Nonce<ChaCha20Poly1305>;
pub(crate) const CHACHAPOLY_NONCE_LENGTH: usize = 12;
pub(crate) const CHACHAPOLY_TAG_LENGTH: usize = 16;

/// Current version of the stored entry format.
pub(crate) const ENTRY_VERSION: u8 = 1;

/// Term used for blobs encrypted directly with the root key.
pub(crate) const ROOT_TERM: u32 = 0;

#[cfg(test)]
#[test]
fn check_length_consts() {
    // GenericArray doesn't give us a way to get the size, so we need to do this
    // in a test...
    assert_eq!(CHACHAPOLY_NONCE_LENGTH, ChaChaPolyNonce::default().len());
}

pub(crate) trait ToWire {
    fn to_wire(&self) -> Vec<u8>;
}

pub(crate) trait FromWire: Sized {
    fn from_wire_partial(input: &[u8]) -> Result<(&[u8], Self), String>;

    fn from_wire<B: AsRef<[u8]>>(input: B) -> Result<Self, String> {
        match Self::from_wire_partial(input.as_ref())? {
            ([], ret) => Ok(ret),
            _ => Err("trailing bytes left after deseralisation".into()),
        }
    }
}

/// An encrypted value as it is written to storage:
///
/// ```text
/// version (u8) | term (u32 BE) | nonce (12 bytes) | ciphertext || tag
/// ```
///
/// The version, term and storage path are all authenticated as associated
/// data, so an entry copied to another path (or relabelled with a different
/// term) no longer decrypts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Entry {
    pub(crate) term: u32,
    nonce: ChaChaPolyNonce,
    ciphertext: Vec<u8>,
}

impl Entry {
    fn aad(term: u32, path: &str) -> Vec<u8> {
        let mut aad = Vec::with_capacity(5 + path.len());
        aad.push(ENTRY_VERSION);
        aad.extend_from_slice(&term.to_be_bytes());
        aad.extend_from_slice(path.as_bytes());
        aad
    }

    /// Encrypt `plaintext` for storage at `path` with the given term's key.
    pub(crate) fn seal(
        key: &[u8],
        term: u32,
        path: &str,
        plaintext: &[u8],
    ) -> Result<Self, aead::Error> {
        let aead = ChaCha20Poly1305::new_from_slice(key).map_err(|_| aead::Error)?;
        let mut nonce = ChaChaPolyNonce::default();
        OsRng.fill_bytes(&mut nonce);

        let payload = Payload {
            msg: plaintext,
            aad: &Self::aad(term, path),
        };
        let ciphertext = aead.encrypt(&nonce, payload)?;

        Ok(Self {
            term,
            nonce,
            ciphertext,
        })
    }

    /// Authenticate and decrypt the entry, which must have been stored at
    /// `path`.
    pub(crate) fn open(&self, key: &[u8], path: &str) -> Result<Zeroizing<Vec<u8>>, aead::Error> {
        let aead = ChaCha20Poly1305::new_from_slice(key).map_err(|_| aead::Error)?;
        let payload = Payload {
            msg: &self.ciphertext,
            aad: &Self::aad(self.term, path),
        };
        aead.decrypt(&self.nonce, payload).map(Zeroizing::new)
    }
}

impl ToWire for Entry {
    fn to_wire(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(5 + CHACHAPOLY_NONCE_LENGTH + self.ciphertext.len());
        bytes.push(ENTRY_VERSION);
        bytes.extend_from_slice(&self.term.to_be_bytes());
        bytes.extend_from_slice(&self.nonce);
        bytes.extend_from_slice(&self.ciphertext);
        bytes
    }
}

impl FromWire for Entry {
    fn from_wire_partial(input: &[u8]) -> Result<(&[u8], Self), String> {
        use nom::{
            bytes::complete::take,
            combinator::{complete, rest, verify},
            number::complete::{be_u32, u8 as nom_u8},
            IResult,
        };

        fn parse(input: &[u8]) -> IResult<&[u8], Entry> {
            let (input, _) = verify(nom_u8, |v| *v == ENTRY_VERSION)(input)?;
            let (input, term) = be_u32(input)?;
            let (input, nonce) = take(CHACHAPOLY_NONCE_LENGTH)(input)?;
            let (input, ciphertext) =
                verify(rest, |ct: &[u8]| ct.len() >= CHACHAPOLY_TAG_LENGTH)(input)?;

            Ok((
                input,
                Entry {
                    term,
                    nonce: ChaChaPolyNonce::clone_from_slice(nonce),
                    ciphertext: ciphertext.to_vec(),
                },
            ))
        }
        let mut parse = complete(parse);

        let (input, entry) = parse(input).map_err(|err| format!("{:?}", err))?;

        Ok((input, entry))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::barrier::generate_key;

    #[quickcheck]
    fn entry_seal_open(plaintext: Vec<u8>, term: u32, path: String) -> bool {
        let key = generate_key();
        let entry = Entry::seal(&key, term, &path, &plaintext).unwrap();
        let parsed = Entry::from_wire(entry.to_wire()).unwrap();
        parsed == entry && *parsed.open(&key, &path).unwrap() == plaintext
    }

    #[test]
    fn layout() {
        let key = generate_key();
        let entry = Entry::seal(&key, 0x01020304, "a/b", b"hello").unwrap();
        let wire = entry.to_wire();
        assert_eq!(wire[0], ENTRY_VERSION);
        assert_eq!(&wire[1..5], &[1, 2, 3, 4]);
        assert_eq!(
            wire.len(),
            5 + CHACHAPOLY_NONCE_LENGTH + b"hello".len() + CHACHAPOLY_TAG_LENGTH
        );
    }

    #[test]
    fn wrong_key_or_path_fails() {
        let key = generate_key();
        let entry = Entry::seal(&key, 1, "a/b", b"hello").unwrap();
        assert!(entry.open(&generate_key(), "a/b").is_err());
        assert!(entry.open(&key, "a/c").is_err());
    }

    #[test]
    fn relabelled_term_fails() {
        let key = generate_key();
        let mut wire = Entry::seal(&key, 1, "a", b"hello").unwrap().to_wire();
        wire[4] = 2;
        let entry = Entry::from_wire(&wire).unwrap();
        assert_eq!(entry.term, 2);
        assert!(entry.open(&key, "a").is_err());
    }

    #[quickcheck]
    fn tampering_detected(plaintext: Vec<u8>, idx: usize, flip: u8) -> bool {
        let key = generate_key();
        let mut wire = Entry::seal(&key, 1, "a", &plaintext).unwrap().to_wire();
        let idx = 5 + idx % (wire.len() - 5);
        wire[idx] ^= flip.max(1);
        let entry = Entry::from_wire(&wire).unwrap();
        entry.open(&key, "a").is_err()
    }

    #[test]
    fn malformed_entries() {
        assert!(Entry::from_wire(b"").is_err());
        // Unknown version.
        assert!(Entry::from_wire([2u8; 64]).is_err());
        // Too short to hold a tag.
        let mut short = vec![ENTRY_VERSION, 0, 0, 0, 1];
        short.extend_from_slice(&[0u8; CHACHAPOLY_NONCE_LENGTH + CHACHAPOLY_TAG_LENGTH - 1]);
        assert!(Entry::from_wire(&short).is_err());
    }
}
