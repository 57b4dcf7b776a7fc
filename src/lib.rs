//! # Content-addressed storage and graph copying for OCI artifacts
//!
//! This crate is the storage-and-graph core of an OCI client: a
//! content-addressed store abstraction (ref [`storage`]) with three
//! interchangeable backends — an in-memory reference implementation
//! ([`memory`]), a durable directory conforming to the OCI image-layout
//! specification ([`layout`]), and a store that maps named files and
//! directories on disk onto OCI descriptors without copying their payload
//! ([`filepack`]) — plus a concurrent graph-copy engine ([`copy`]) that
//! shuttles a manifest sub-graph between any two of them.
//!
//! Registry wire protocol (HTTP, auth, retries) is deliberately out of
//! scope: anything that can produce a [`storage::GraphTarget`] — in
//! particular a remote-registry client — plugs into [`copy::copy`] the
//! same way the backends in this crate do.
//!
//! ## Getting started
//!
//! ```rust,no_run
//! # fn main() -> occas::error::Result<()> {
//! use occas::memory::MemoryStore;
//! use occas::layout::LayoutStore;
//! use occas::copy::{copy, CopyOptions};
//!
//! let source = MemoryStore::new();
//! // ... push a manifest sub-graph into `source` ...
//!
//! let dir = occas::cap_std::fs::Dir::open_ambient_dir(
//!     "/path/to/oci-layout",
//!     occas::cap_std::ambient_authority(),
//! )?;
//! let destination = LayoutStore::ensure(&dir)?;
//!
//! copy(&source, &destination, "latest", Some("latest"), CopyOptions::default())?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Dependency on cap-std
//!
//! [`layout::LayoutStore`] operates in a capability-oriented fashion via
//! [cap-std]: its root directory handle cannot escape its own tree. The
//! file-pack store ([`filepack`]) cannot make the same promise — its
//! `allowPathTraversalOnWrite` escape hatch is a first-class feature — so
//! it resolves paths with plain `std::path` instead; see the module docs
//! there for the reasoning.
//!
//! [cap-std]: https://docs.rs/cap-std/

pub use cap_std_ext::cap_std;

pub mod copy;
pub mod descriptor;
pub mod digest;
pub mod error;
pub mod filepack;
pub mod graph;
pub mod layout;
pub mod lock;
pub mod memory;
pub mod storage;

pub use descriptor::{descriptor_from_bytes, Descriptor};
pub use digest::{Algorithm, Digest, Verifier};
pub use error::{Error, Result};
pub use storage::{CancelToken, GraphTarget, PredecessorFinder, Storage, TagResolver};
