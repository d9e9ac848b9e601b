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

use std::{
    fmt,
    fs::{self, OpenOptions},
    io::{ErrorKind, Write},
    path::Path,
    sync::Arc,
};

use aead::{Aead, KeyInit, Payload};
use chacha20poly1305::ChaCha20Poly1305;
use rand::{rngs::OsRng, RngCore};
use zeroize::Zeroizing;

/// A key management service able to encrypt and decrypt small blobs with a
/// key it never reveals.
pub trait Kms: Send + Sync {
    fn name(&self) -> &str;

    fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, Error>;

    fn decrypt(&self, ciphertext: &[u8], aad: &[u8]) -> Result<Zeroizing<Vec<u8>>, Error>;
}

type ChaChaPolyNonce = aead::Nonce<ChaCha20Poly1305>;
const CHACHAPOLY_KEY_LENGTH: usize = 32;
const CHACHAPOLY_NONCE_LENGTH: usize = 12;

/// A [`Kms`] backed by a ChaCha20-Poly1305 key held in process memory (and
/// optionally loaded from a file). Ciphertexts are `nonce || ciphertext`.
pub struct LocalKms {
    name: String,
    key: Zeroizing<Vec<u8>>,
}

impl LocalKms {
    pub const NAME: &'static str = "localkms";

    pub fn new(key: &[u8]) -> Result<Self, Error> {
        if key.len() != CHACHAPOLY_KEY_LENGTH {
            return Err(Error::InvalidKeyLength(CHACHAPOLY_KEY_LENGTH));
        }
        Ok(Self {
            name: Self::NAME.to_string(),
            key: Zeroizing::new(key.to_vec()),
        })
    }

    pub fn generate() -> Self {
        let mut key = Zeroizing::new(vec![0u8; CHACHAPOLY_KEY_LENGTH]);
        OsRng.fill_bytes(&mut key);
        Self {
            name: Self::NAME.to_string(),
            key,
        }
    }

    /// Use a different name, so several local KMS instances can be told apart
    /// inside a [`MultiSeal`](crate::seal::MultiSeal).
    pub fn with_name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = name.into();
        self
    }

    /// Load the key from `path`, creating a new random key file (readable only
    /// by the owner) if it doesn't exist yet.
    pub fn load_or_create<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();
        let io_err = |source| Error::KeyFile {
            path: path.to_path_buf(),
            source,
        };
        match fs::read(path) {
            Ok(key) => Self::new(&Zeroizing::new(key)),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                let kms = Self::generate();
                let mut options = OpenOptions::new();
                options.write(true).create_new(true);
                #[cfg(unix)]
                {
                    use std::os::unix::fs::OpenOptionsExt;
                    options.mode(0o600);
                }
                let mut file = options.open(path).map_err(io_err)?;
                file.write_all(&kms.key).map_err(io_err)?;
                file.sync_all().map_err(io_err)?;
                tracing::info!(path = %path.display(), "generated new local kms key");
                Ok(kms)
            }
            Err(err) => Err(io_err(err)),
        }
    }

    fn aead(&self) -> Result<ChaCha20Poly1305, Error> {
        ChaCha20Poly1305::new_from_slice(&self.key)
            .map_err(|_| Error::InvalidKeyLength(CHACHAPOLY_KEY_LENGTH))
    }
}

impl fmt::Debug for LocalKms {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalKms")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl Kms for LocalKms {
    fn name(&self) -> &str {
        &self.name
    }

    fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, Error> {
        let mut nonce = ChaChaPolyNonce::default();
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = self
            .aead()?
            .encrypt(&nonce, Payload { msg: plaintext, aad })
            .map_err(|_| Error::Encrypt {
                name: self.name.clone(),
            })?;
        Ok(nonce.iter().copied().chain(ciphertext).collect())
    }

    fn decrypt(&self, ciphertext: &[u8], aad: &[u8]) -> Result<Zeroizing<Vec<u8>>, Error> {
        if ciphertext.len() < CHACHAPOLY_NONCE_LENGTH {
            return Err(Error::MalformedBlob("ciphertext shorter than nonce".into()));
        }
        let (nonce, msg) = ciphertext.split_at(CHACHAPOLY_NONCE_LENGTH);
        self.aead()?
            .decrypt(ChaChaPolyNonce::from_slice(nonce), Payload { msg, aad })
            .map(Zeroizing::new)
            .map_err(|_| Error::Decrypt {
                name: self.name.clone(),
            })
    }
}

/// Auto-unseal: the root key is wrapped by a [`Kms`].
#[derive(Clone)]
pub struct KmsSeal {
    kms: Arc<dyn Kms>,
}

impl KmsSeal {
    const AAD: &'static [u8] = b"strongroom wrapped key";

    pub fn new(kms: Arc<dyn Kms>) -> Self {
        Self { kms }
    }
}

impl SealBackend for KmsSeal {
    fn seal_type(&self) -> String {
        self.kms.name().to_string()
    }

    fn auto_unseal(&self) -> bool {
        true
    }

    fn wrap_root_key(&self, plaintext: &[u8]) -> Result<Vec<u8>, Error> {
        self.kms.encrypt(plaintext, Self::AAD)
    }

    fn unwrap_root_key(&self, blob: &[u8]) -> Result<Zeroizing<Vec<u8>>, Error> {
        self.kms.decrypt(blob, Self::AAD)
    }
}
