//! The reference `Storage`/`TagResolver`/`PredecessorFinder` implementation:
//! a mutex-guarded in-memory map. Used directly by callers who don't need
//! durability, and embedded by the file-pack store to hold manifests.

use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::sync::{Arc, Mutex};

use log::trace;

use crate::descriptor::Descriptor;
use crate::digest::Digest;
use crate::error::{Error, Result};
use crate::graph;
use crate::storage::{PredecessorFinder, Storage, TagResolver};

#[derive(Default)]
struct Inner {
    blobs: HashMap<Digest, Vec<u8>>,
    tags: HashMap<String, Descriptor>,
    predecessors: HashMap<Digest, Vec<Descriptor>>,
}

/// An in-memory content-addressed store. Cheap to clone (shares state via
/// `Arc`); push is an atomic insert-if-absent under a single mutex.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    fn record_predecessors(&self, descriptor: &Descriptor) -> Result<()> {
        if !descriptor.is_manifest_like() {
            return Ok(());
        }
        for child in graph::successors(self, descriptor)? {
            let mut inner = self.inner.lock().unwrap();
            inner
                .predecessors
                .entry(child.digest.clone())
                .or_default()
                .push(descriptor.clone());
        }
        Ok(())
    }
}

impl Storage for MemoryStore {
    type Reader = Cursor<Vec<u8>>;

    fn fetch(&self, descriptor: &Descriptor) -> Result<Self::Reader> {
        let inner = self.inner.lock().unwrap();
        let bytes = inner
            .blobs
            .get(&descriptor.digest)
            .cloned()
            .ok_or(Error::NotFound)?;
        Ok(Cursor::new(bytes))
    }

    fn push(&self, descriptor: &Descriptor, content: impl Read) -> Result<()> {
        let bytes = crate::digest::read_all(content, descriptor)?;
        let already_present = {
            let mut inner = self.inner.lock().unwrap();
            let present = inner.blobs.contains_key(&descriptor.digest);
            if !present {
                inner.blobs.insert(descriptor.digest.clone(), bytes);
            }
            present
        };
        trace!(
            "memory push digest={} size={} already_present={}",
            descriptor.digest,
            descriptor.size,
            already_present
        );
        // Resolved Open Question (SPEC_FULL.md 4.3): a second push of the
        // same digest is an idempotent no-op, not ErrAlreadyExists.
        if !already_present {
            self.record_predecessors(descriptor)?;
        }
        Ok(())
    }

    fn exists(&self, descriptor: &Descriptor) -> Result<bool> {
        Ok(self.inner.lock().unwrap().blobs.contains_key(&descriptor.digest))
    }
}

impl TagResolver for MemoryStore {
    fn resolve(&self, reference: &str) -> Result<Descriptor> {
        self.inner
            .lock()
            .unwrap()
            .tags
            .get(reference)
            .cloned()
            .ok_or(Error::NotFound)
    }

    fn tag(&self, descriptor: &Descriptor, reference: &str) -> Result<()> {
        if !self.exists(descriptor)? {
            return Err(Error::NotFound);
        }
        self.inner
            .lock()
            .unwrap()
            .tags
            .insert(reference.to_string(), descriptor.clone());
        Ok(())
    }
}

impl PredecessorFinder for MemoryStore {
    fn predecessors(&self, descriptor: &Descriptor) -> Result<Vec<Descriptor>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .predecessors
            .get(&descriptor.digest)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::descriptor_from_bytes;
    use std::io::Read as _;

    #[test]
    fn e1_memory_round_trip() {
        let store = MemoryStore::new();
        let bytes = b"hello world";
        let desc =
            descriptor_from_bytes("application/vnd.oci.image.layer.v1.tar", bytes).unwrap();
        assert_eq!(
            desc.digest.to_string(),
            "sha256:b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        assert!(!store.exists(&desc).unwrap());
        store.push(&desc, &bytes[..]).unwrap();
        assert!(store.exists(&desc).unwrap());
        let mut read_back = Vec::new();
        store.fetch(&desc).unwrap().read_to_end(&mut read_back).unwrap();
        assert_eq!(read_back, bytes);
        // second push is idempotent
        store.push(&desc, &bytes[..]).unwrap();
    }

    #[test]
    fn e2_digest_mismatch_does_not_store() {
        let store = MemoryStore::new();
        let desc = descriptor_from_bytes("application/vnd.oci.image.layer.v1.tar", b"foo").unwrap();
        let err = store.push(&desc, &b"bar"[..]).unwrap_err();
        assert!(matches!(err, Error::MismatchedDigest { .. }));
        assert!(!store.exists(&desc).unwrap());
    }

    #[test]
    fn tag_requires_existing_digest() {
        let store = MemoryStore::new();
        let desc = descriptor_from_bytes("application/vnd.oci.image.layer.v1.tar", b"x").unwrap();
        assert!(matches!(store.tag(&desc, "latest"), Err(Error::NotFound)));
        store.push(&desc, &b"x"[..]).unwrap();
        store.tag(&desc, "latest").unwrap();
        assert_eq!(store.resolve("latest").unwrap(), desc);
    }
}
