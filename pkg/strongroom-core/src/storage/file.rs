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

use crate::storage::{validate_key, validate_prefix, Error, Storage};

use std::{
    fs::{self, OpenOptions},
    io::{self, ErrorKind, Write},
    path::{Path, PathBuf},
};

/// Storage backed by a directory tree.
///
/// Each key `a/b/c` lives in the file `a/b/_c` under the root directory. The
/// underscore keeps values and folders from colliding (`a/b` can be both a
/// value and a folder). Writes go to a temporary file which is renamed over
/// the old value, so a crash never leaves a half-written entry behind.
#[derive(Debug, Clone)]
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self, Error> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(|source| Error::Io {
            key: root.display().to_string(),
            source,
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_path(&self, key: &str) -> (PathBuf, String) {
        let (dir, name) = match key.rsplit_once('/') {
            Some((dir, name)) => (self.root.join(dir), name),
            None => (self.root.clone(), key),
        };
        (dir, format!("_{}", name))
    }

    fn open_new(path: &Path) -> io::Result<fs::File> {
        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        options.open(path)
    }

    // Remove now-empty folders between the entry and the root.
    fn prune(&self, mut dir: &Path) {
        while dir != self.root && dir.starts_with(&self.root) {
            if fs::remove_dir(dir).is_err() {
                break;
            }
            match dir.parent() {
                Some(parent) => dir = parent,
                None => break,
            }
        }
    }
}

impl Storage for FileStorage {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Error> {
        validate_key(key)?;
        let (dir, name) = self.entry_path(key);
        match fs::read(dir.join(name)) {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(source) => Err(Error::Io {
                key: key.to_string(),
                source,
            }),
        }
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), Error> {
        validate_key(key)?;
        let (dir, name) = self.entry_path(key);
        let tmp_path = dir.join(format!(".{}.tmp", name));
        let write = || -> io::Result<()> {
            fs::create_dir_all(&dir)?;
            let mut file = Self::open_new(&tmp_path)?;
            file.write_all(value)?;
            file.sync_all()?;
            fs::rename(&tmp_path, dir.join(&name))
        };
        write().map_err(|source| {
            let _ = fs::remove_file(&tmp_path);
            Error::Io {
                key: key.to_string(),
                source,
            }
        })
    }

    fn delete(&self, key: &str) -> Result<(), Error> {
        validate_key(key)?;
        let (dir, name) = self.entry_path(key);
        match fs::remove_file(dir.join(name)) {
            Ok(()) => {
                self.prune(&dir);
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(Error::Io {
                key: key.to_string(),
                source,
            }),
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, Error> {
        validate_prefix(prefix)?;
        let dir = self.root.join(prefix.trim_end_matches('/'));
        let read_dir = match fs::read_dir(&dir) {
            Ok(read_dir) => read_dir,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(Error::Io {
                    key: prefix.to_string(),
                    source,
                })
            }
        };

        let mut names = Vec::new();
        for entry in read_dir {
            let entry = entry.map_err(|source| Error::Io {
                key: prefix.to_string(),
                source,
            })?;
            let file_type = entry.file_type().map_err(|source| Error::Io {
                key: prefix.to_string(),
                source,
            })?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if file_type.is_dir() {
                names.push(format!("{}/", name));
            } else if let Some(name) = name.strip_prefix('_') {
                names.push(name.to_string());
            }
        }
        names.sort();
        names.dedup();
        Ok(names)
    }
}
