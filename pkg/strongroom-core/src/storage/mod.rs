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

//! Physical key-value storage underneath the barrier.
//!
//! Keys are `/`-separated paths. Listing is one level deep: `list("a/")`
//! returns the direct children of `a/`, with sub-folders marked by a trailing
//! `/` (so `a/b/c` shows up as `b/`).

mod file;
mod inmem;

pub use file::FileStorage;
pub use inmem::InmemStorage;

use std::io;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid storage key {0:?}")]
    InvalidKey(String),

    #[error("storage i/o error on {key:?}: {source}")]
    Io {
        key: String,
        #[source]
        source: io::Error,
    },

    #[error("storage backend failure: {0}")]
    Backend(String),
}

/// A key-value store. Implementations must provide read-after-write
/// consistency for a single process.
pub trait Storage: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Error>;

    fn put(&self, key: &str, value: &[u8]) -> Result<(), Error>;

    /// Deleting a key which doesn't exist is not an error.
    fn delete(&self, key: &str) -> Result<(), Error>;

    fn list(&self, prefix: &str) -> Result<Vec<String>, Error>;
}

/// Reduce a full key under `prefix` to the single path component listed for
/// it, keeping the trailing `/` of folders.
pub(crate) fn list_entry<'a>(prefix: &str, key: &'a str) -> Option<&'a str> {
    let rest = key.strip_prefix(prefix)?;
    match rest.find('/') {
        Some(idx) => Some(&rest[..=idx]),
        None if rest.is_empty() => None,
        None => Some(rest),
    }
}

pub(crate) fn validate_key(key: &str) -> Result<(), Error> {
    let bad = key.is_empty()
        || key.starts_with('/')
        || key.ends_with('/')
        || key.split('/').any(|c| c.is_empty() || c == "." || c == "..")
        || key.contains('\0');
    match bad {
        true => Err(Error::InvalidKey(key.to_string())),
        false => Ok(()),
    }
}

/// List prefixes are either empty (the root) or a folder ending in `/`.
pub(crate) fn validate_prefix(prefix: &str) -> Result<(), Error> {
    match prefix.strip_suffix('/') {
        None if prefix.is_empty() => Ok(()),
        Some(folder) => validate_key(folder).map_err(|_| Error::InvalidKey(prefix.to_string())),
        None => Err(Error::InvalidKey(prefix.to_string())),
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;

    use std::{
        sync::{Arc, Mutex, PoisonError},
        thread,
        time::Duration,
    };

    type WriteHook = Box<dyn FnOnce() + Send>;

    /// In-memory storage which fails operations on one chosen key, and can
    /// be made to write slowly or run a hook after a chosen write.
    #[derive(Default)]
    pub(crate) struct FlakyStorage {
        inner: InmemStorage,
        fail_key: Mutex<Option<String>>,
        fail_write_key: Mutex<Option<String>>,
        write_delay: Mutex<Option<Duration>>,
        after_write: Mutex<Option<(String, WriteHook)>>,
    }

    fn set(slot: &Mutex<Option<String>>, key: Option<&str>) {
        *slot.lock().unwrap_or_else(PoisonError::into_inner) = key.map(String::from);
    }

    fn check(slot: &Mutex<Option<String>>, key: &str) -> Result<(), Error> {
        let fail_key = slot.lock().unwrap_or_else(PoisonError::into_inner);
        match fail_key.as_deref() {
            Some(fail) if fail == key => {
                Err(Error::Backend(format!("injected failure on {}", key)))
            }
            _ => Ok(()),
        }
    }

    impl FlakyStorage {
        /// Fail every operation on `key`.
        pub(crate) fn fail_on(&self, key: Option<&str>) {
            set(&self.fail_key, key);
        }

        /// Fail puts and deletes of `key`, reads still work.
        pub(crate) fn fail_writes_on(&self, key: Option<&str>) {
            set(&self.fail_write_key, key);
        }

        /// Sleep for `delay` before every put and delete.
        pub(crate) fn delay_writes(&self, delay: Option<Duration>) {
            *self
                .write_delay
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = delay;
        }

        /// Run `hook` once, right after the next successful put of `key`.
        pub(crate) fn after_write<F: FnOnce() + Send + 'static>(&self, key: &str, hook: F) {
            let mut slot = self.after_write.lock().unwrap_or_else(PoisonError::into_inner);
            *slot = Some((key.to_string(), Box::new(hook)));
        }

        fn run_hook(&self, key: &str) {
            let hook = {
                let mut slot = self.after_write.lock().unwrap_or_else(PoisonError::into_inner);
                match slot.take() {
                    Some((hook_key, hook)) if hook_key == key => Some(hook),
                    other => {
                        *slot = other;
                        None
                    }
                }
            };
            // The lock is released so the hook may use this storage.
            if let Some(hook) = hook {
                hook();
            }
        }

        fn check_read(&self, key: &str) -> Result<(), Error> {
            check(&self.fail_key, key)
        }

        fn check_write(&self, key: &str) -> Result<(), Error> {
            let delay = *self
                .write_delay
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(delay) = delay {
                thread::sleep(delay);
            }
            check(&self.fail_key, key)?;
            check(&self.fail_write_key, key)
        }
    }

    impl Storage for FlakyStorage {
        fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Error> {
            self.check_read(key)?;
            self.inner.get(key)
        }

        fn put(&self, key: &str, value: &[u8]) -> Result<(), Error> {
            self.check_write(key)?;
            self.inner.put(key, value)?;
            self.run_hook(key);
            Ok(())
        }

        fn delete(&self, key: &str) -> Result<(), Error> {
            self.check_write(key)?;
            self.inner.delete(key)
        }

        fn list(&self, prefix: &str) -> Result<Vec<String>, Error> {
            self.check_read(prefix)?;
            self.inner.list(prefix)
        }
    }

    #[test]
    fn flaky_storage_semantics() {
        let storage = FlakyStorage::default();
        exercise(&storage);
        storage.fail_on(Some("a"));
        assert!(matches!(storage.get("a"), Err(Error::Backend(_))));
        assert!(storage.get("b").is_ok());
        storage.fail_on(None);
        assert!(storage.get("a").is_ok());

        storage.fail_writes_on(Some("a"));
        assert!(storage.get("a").is_ok());
        assert!(matches!(storage.put("a", b"x"), Err(Error::Backend(_))));
        assert!(matches!(storage.delete("a"), Err(Error::Backend(_))));
        storage.fail_writes_on(None);

        let fired = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&fired);
        storage.after_write("b", move || *counter.lock().unwrap() += 1);
        storage.put("a", b"1").unwrap();
        assert_eq!(*fired.lock().unwrap(), 0);
        storage.put("b", b"1").unwrap();
        storage.put("b", b"2").unwrap();
        assert_eq!(*fired.lock().unwrap(), 1);
    }

    #[test]
    fn list_entry_levels() {
        assert_eq!(list_entry("", "foo"), Some("foo"));
        assert_eq!(list_entry("", "foo/bar"), Some("foo/"));
        assert_eq!(list_entry("foo/", "foo/bar/baz"), Some("bar/"));
        assert_eq!(list_entry("foo/", "foo/bar"), Some("bar"));
        assert_eq!(list_entry("foo/", "foobar"), None);
        assert_eq!(list_entry("foo/", "foo/"), None);
    }

    #[test]
    fn key_validation() {
        for key in ["a", "a/b", "core/keyring", "secret/foo.json"] {
            assert!(validate_key(key).is_ok(), "{:?} should be valid", key);
        }
        for key in ["", "/a", "a/", "a//b", "a/../b", ".", "a\0b"] {
            assert!(validate_key(key).is_err(), "{:?} should be invalid", key);
        }
    }

    /// Behaviour every [`Storage`] implementation has to share.
    pub(crate) fn exercise(storage: &dyn Storage) {
        assert_eq!(storage.get("missing").unwrap(), None);

        storage.put("a", b"1").unwrap();
        storage.put("dir/b", b"2").unwrap();
        storage.put("dir/sub/c", b"3").unwrap();
        assert_eq!(storage.get("a").unwrap().as_deref(), Some(&b"1"[..]));
        assert_eq!(storage.get("dir/sub/c").unwrap().as_deref(), Some(&b"3"[..]));

        storage.put("a", b"overwritten").unwrap();
        assert_eq!(
            storage.get("a").unwrap().as_deref(),
            Some(&b"overwritten"[..])
        );

        let mut root = storage.list("").unwrap();
        root.sort();
        assert_eq!(root, vec!["a".to_string(), "dir/".to_string()]);
        let mut dir = storage.list("dir/").unwrap();
        dir.sort();
        assert_eq!(dir, vec!["b".to_string(), "sub/".to_string()]);
        assert!(storage.list("nothing/").unwrap().is_empty());
        assert!(matches!(storage.list("dir"), Err(Error::InvalidKey(_))));

        storage.delete("a").unwrap();
        storage.delete("a").unwrap();
        assert_eq!(storage.get("a").unwrap(), None);

        assert!(matches!(
            storage.put("../escape", b"x"),
            Err(Error::InvalidKey(_))
        ));
    }
}
