//! Capability traits a backend implements, and the cooperative
//! cancellation handle threaded through long-running operations.

use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::descriptor::Descriptor;
use crate::error::{Error, Result};

/// A cooperative cancellation signal shared by a caller across a `copy()`
/// invocation (and, optionally, threaded into a single long-running
/// backend operation). Cheap to poll; `cancel()` is idempotent.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Base capability: fetch, push, and membership-check content by descriptor.
pub trait Storage {
    /// A reader over content verified to match `descriptor`.
    type Reader: Read;

    /// Fails with [`Error::NotFound`] if `descriptor` is unknown.
    fn fetch(&self, descriptor: &Descriptor) -> Result<Self::Reader>;

    /// Stores content iff the streamed bytes verify against `descriptor`.
    /// Backend-dependent whether a duplicate push of existing content is
    /// an idempotent no-op or surfaces [`Error::AlreadyExists`].
    fn push(&self, descriptor: &Descriptor, content: impl Read) -> Result<()>;

    /// Cheap membership check; never fails on a miss.
    fn exists(&self, descriptor: &Descriptor) -> Result<bool>;
}

/// Symbolic reference resolution and (re)tagging.
pub trait TagResolver {
    fn resolve(&self, reference: &str) -> Result<Descriptor>;

    /// Overwriting an existing tag is permitted.
    fn tag(&self, descriptor: &Descriptor, reference: &str) -> Result<()>;
}

/// Reverse-edge lookup: who points at this descriptor.
pub trait PredecessorFinder {
    fn predecessors(&self, descriptor: &Descriptor) -> Result<Vec<Descriptor>>;
}

/// The full capability set the copy engine needs on both ends of a copy.
pub trait GraphTarget: Storage + TagResolver + PredecessorFinder {}
impl<T: Storage + TagResolver + PredecessorFinder> GraphTarget for T {}
