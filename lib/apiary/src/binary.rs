// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Immutable storage for loaded program images.

use std::fmt;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;

/// A refcounted, immutable byte blob holding a tenant program image.
///
/// Cloning is cheap (a refcount bump) and the contents never change after
/// publication, so images may be shared freely between the main VM, its
/// forks, and any in-flight live update without synchronization.
#[derive(Clone, Default)]
pub struct BinaryStorage {
    bytes: Arc<Vec<u8>>,
}

impl BinaryStorage {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes: Arc::new(bytes) }
    }

    /// Loads an image from the local filesystem.
    pub fn from_file(path: impl AsRef<Path>) -> io::Result<Self> {
        Ok(Self::new(fs::read(path)?))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.bytes.as_ref().clone()
    }
}

impl fmt::Debug for BinaryStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BinaryStorage").field("len", &self.bytes.len()).finish()
    }
}

impl From<Vec<u8>> for BinaryStorage {
    fn from(bytes: Vec<u8>) -> Self {
        Self::new(bytes)
    }
}

impl From<&[u8]> for BinaryStorage {
    fn from(bytes: &[u8]) -> Self {
        Self::new(bytes.to_vec())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn shared_contents_are_stable() {
        let a = BinaryStorage::new(vec![1, 2, 3]);
        let b = a.clone();
        assert_eq!(a.as_bytes(), b.as_bytes());
        assert_eq!(a.len(), 3);
        drop(a);
        assert_eq!(b.as_bytes(), &[1, 2, 3]);
    }

    #[test]
    fn empty_default() {
        assert!(BinaryStorage::default().is_empty());
    }
}
