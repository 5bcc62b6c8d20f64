/*
 *
 *    Copyright (c) 2020-2022 Project CHIP Authors
 *
 *    Licensed under the Apache License, Version 2.0 (the "License");
 *    you may not use this file except in compliance with the License.
 *    You may obtain a copy of the License at
 *
 *        http://www.apache.org/licenses/LICENSE-2.0
 *
 *    Unless required by applicable law or agreed to in writing, software
 *    distributed under the License is distributed on an "AS IS" BASIS,
 *    WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *    See the License for the specific language governing permissions and
 *    limitations under the License.
 */

//! Persistent key-value storage consumed by the session layer.
//!
//! The transport keeps two kinds of state here: the reservation of the global
//! unsecured message counter and the CASE session resumption records.

use alloc::collections::BTreeMap;
use alloc::rc::Rc;
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use core::cell::RefCell;

use crate::error::{Error, ErrorCode};

pub trait KvStore {
    /// Load the value stored under `key` into `buf`
    fn load<'a>(&self, key: &str, buf: &'a mut [u8]) -> Result<Option<&'a [u8]>, Error>;

    fn store(&mut self, key: &str, data: &[u8]) -> Result<(), Error>;

    fn remove(&mut self, key: &str) -> Result<(), Error>;
}

/// A volatile store.
///
/// Clones share the same contents, so a clone handed to a transport that is
/// later dropped still shows what it persisted. Tests use this to model a reboot.
#[derive(Clone, Default)]
pub struct MemKvStore {
    entries: Rc<RefCell<BTreeMap<String, Vec<u8>>>>,
}

impl MemKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }
}

impl KvStore for MemKvStore {
    fn load<'a>(&self, key: &str, buf: &'a mut [u8]) -> Result<Option<&'a [u8]>, Error> {
        let entries = self.entries.borrow();

        match entries.get(key) {
            Some(data) => {
                if data.len() > buf.len() {
                    Err(ErrorCode::NoSpace)?;
                }

                buf[..data.len()].copy_from_slice(data);
                Ok(Some(&buf[..data.len()]))
            }
            None => Ok(None),
        }
    }

    fn store(&mut self, key: &str, data: &[u8]) -> Result<(), Error> {
        self.entries
            .borrow_mut()
            .insert(key.to_string(), data.to_vec());

        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<(), Error> {
        self.entries.borrow_mut().remove(key);

        Ok(())
    }
}

#[cfg(feature = "std")]
pub use file_psm::*;

#[cfg(feature = "std")]
mod file_psm {
    use std::fs;
    use std::io::{ErrorKind, Read, Write};
    use std::path::PathBuf;

    use log::debug;

    use crate::error::{Error, ErrorCode};

    use super::KvStore;

    /// Stores every key as a file of the same name in `dir`
    pub struct FileKvStore {
        dir: PathBuf,
    }

    impl FileKvStore {
        pub fn new(dir: PathBuf) -> Result<Self, Error> {
            fs::create_dir_all(&dir)?;

            Ok(Self { dir })
        }
    }

    impl KvStore for FileKvStore {
        fn load<'a>(&self, key: &str, buf: &'a mut [u8]) -> Result<Option<&'a [u8]>, Error> {
            let path = self.dir.join(key);

            match fs::File::open(path) {
                Ok(mut file) => {
                    let mut offset = 0;

                    loop {
                        if offset == buf.len() {
                            if file.read(&mut [0; 1])? > 0 {
                                Err(ErrorCode::NoSpace)?;
                            }

                            break;
                        }

                        let len = file.read(&mut buf[offset..])?;

                        if len == 0 {
                            break;
                        }

                        offset += len;
                    }

                    let data = &buf[..offset];

                    debug!("Key {}: loaded {} bytes", key, data.len());

                    Ok(Some(data))
                }
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
                Err(e) => Err(e.into()),
            }
        }

        fn store(&mut self, key: &str, data: &[u8]) -> Result<(), Error> {
            let path = self.dir.join(key);

            let mut file = fs::File::create(path)?;

            file.write_all(data)?;
            file.sync_all()?;

            debug!("Key {}: stored {} bytes", key, data.len());

            Ok(())
        }

        fn remove(&mut self, key: &str) -> Result<(), Error> {
            match fs::remove_file(self.dir.join(key)) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_store_shared_between_clones() {
        let mut store = MemKvStore::new();
        let other = store.clone();

        store.store("k", &[1, 2, 3]).unwrap();

        let mut buf = [0; 8];
        assert_eq!(other.load("k", &mut buf).unwrap(), Some(&[1, 2, 3][..]));

        store.remove("k").unwrap();
        assert!(other.load("k", &mut buf).unwrap().is_none());
        assert!(other.is_empty());
    }

    #[test]
    fn mem_store_small_buffer() {
        let mut store = MemKvStore::new();
        store.store("k", &[0; 16]).unwrap();

        let mut buf = [0; 8];
        assert_eq!(
            store.load("k", &mut buf).unwrap_err().code(),
            ErrorCode::NoSpace
        );
    }

    #[cfg(feature = "std")]
    #[test]
    fn file_store_roundtrip() {
        let dir = std::env::temp_dir().join(format!("rs-matter-session-kv-{}", std::process::id()));
        let mut store = FileKvStore::new(dir.clone()).unwrap();

        store.store("unsec-ctr", &42u32.to_le_bytes()).unwrap();

        let mut buf = [0; 8];
        assert_eq!(
            store.load("unsec-ctr", &mut buf).unwrap(),
            Some(&42u32.to_le_bytes()[..])
        );

        store.remove("unsec-ctr").unwrap();
        store.remove("unsec-ctr").unwrap();
        assert!(store.load("unsec-ctr", &mut buf).unwrap().is_none());

        let _ = std::fs::remove_dir_all(dir);
    }
}
