//! A durable [`crate::storage::GraphTarget`] rooted at a directory
//! conforming to the OCI image-layout specification:
//! `oci-layout`, `index.json`, `blobs/<algorithm>/<hex>`.
//!
//! Generalizes `ocidir::OciDir` from a single-manifest-stack writer into a
//! full content-addressed store: every push is keyed by digest, tags are
//! a first-class operation independent of push, and a predecessor index is
//! built by walking the index at open time.

use std::collections::HashMap;
use std::io::{BufReader, Read};
use std::sync::{Arc, Mutex};

use cap_std_ext::cap_std::fs::{Dir, DirBuilder, DirBuilderExt};
use cap_std_ext::cap_std::{self, ambient_authority};
use cap_std_ext::cap_tempfile;
use cap_std_ext::dirext::CapStdExtDirExt;
use log::{debug, trace};
use serde::{Deserialize, Serialize};

use crate::descriptor::{Descriptor, ANNOTATION_REF_NAME};
use crate::digest::{Digest, Verifier};
use crate::error::{Error, Result};
use crate::graph;
use crate::storage::{PredecessorFinder, Storage, TagResolver};

const LAYOUT_FILE: &str = "oci-layout";
const INDEX_FILE: &str = "index.json";
const LAYOUT_CONTENTS: &str = r#"{"imageLayoutVersion":"1.0.0"}"#;

#[derive(Serialize, Deserialize)]
struct OnDiskIndex {
    #[serde(rename = "schemaVersion")]
    schema_version: u32,
    manifests: Vec<Descriptor>,
}

struct State {
    manifests: Vec<Descriptor>,
    tags: HashMap<String, Descriptor>,
    predecessors: HashMap<Digest, Vec<Descriptor>>,
}

impl State {
    fn from_manifests(manifests: Vec<Descriptor>) -> Self {
        let mut tags = HashMap::new();
        for m in &manifests {
            if let Some(tag) = m.tag() {
                tags.insert(tag.to_string(), m.clone());
            }
        }
        Self {
            manifests,
            tags,
            predecessors: HashMap::new(),
        }
    }
}

/// An opened OCI image-layout directory.
pub struct LayoutStore {
    dir: Arc<Dir>,
    state: Mutex<State>,
    read_only: bool,
}

impl LayoutStore {
    /// Open the directory at `dir`, creating the standard OCI metadata and
    /// an empty index if it does not already have them.
    pub fn ensure(dir: &Dir) -> Result<Self> {
        let mut db = DirBuilder::new();
        db.recursive(true).mode(0o755);
        dir.ensure_dir_with("blobs", &db)?;
        dir.ensure_dir_with("ingest", &db)?;
        if !dir.try_exists(LAYOUT_FILE)? {
            dir.atomic_write(LAYOUT_FILE, LAYOUT_CONTENTS)?;
        }
        Self::open(dir)
    }

    /// Open an existing layout directory at an ambient filesystem path.
    pub fn ensure_path(path: impl AsRef<camino::Utf8Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut db = DirBuilder::new();
        db.recursive(true).mode(0o755);
        cap_std::fs::Dir::create_ambient_dir_all(path, ambient_authority())?;
        let dir = Dir::open_ambient_dir(path, ambient_authority())?;
        Self::ensure(&dir)
    }

    /// Open an existing layout directory, loading its index and rebuilding
    /// the predecessor index by walking every manifest it names. Fails if
    /// `oci-layout` is missing or malformed.
    pub fn open(dir: &Dir) -> Result<Self> {
        let dir = Arc::new(dir.try_clone()?);
        let layout_contents = dir.read_to_string(LAYOUT_FILE)?;
        let parsed: serde_json::Value = serde_json::from_str(&layout_contents)?;
        if parsed.get("imageLayoutVersion").and_then(|v| v.as_str()) != Some("1.0.0") {
            return Err(Error::InvalidManifest("unsupported imageLayoutVersion".into()));
        }
        let manifests = Self::read_index_file(&dir)?.unwrap_or_default();
        let store = Self {
            dir,
            state: Mutex::new(State::from_manifests(manifests)),
            read_only: false,
        };
        store.rebuild_predecessors()?;
        Ok(store)
    }

    /// A read-only view: `fetch`/`exists`/`resolve`/`predecessors` work,
    /// `push`/`tag` fail with [`Error::UnsupportedOperation`].
    pub fn open_read_only(dir: &Dir) -> Result<Self> {
        let mut store = Self::open(dir)?;
        store.read_only = true;
        Ok(store)
    }

    fn read_index_file(dir: &Dir) -> Result<Option<Vec<Descriptor>>> {
        let Some(f) = dir.open_optional(INDEX_FILE)? else {
            return Ok(None);
        };
        let idx: OnDiskIndex = serde_json::from_reader(BufReader::new(f))?;
        Ok(Some(idx.manifests))
    }

    fn rebuild_predecessors(&self) -> Result<()> {
        let manifests = self.state.lock().unwrap().manifests.clone();
        for manifest in &manifests {
            for child in graph::successors(self, manifest)? {
                self.state
                    .lock()
                    .unwrap()
                    .predecessors
                    .entry(child.digest.clone())
                    .or_default()
                    .push(manifest.clone());
            }
        }
        Ok(())
    }

    /// Snapshot-serialize-`atomic_replace_with` under a single critical
    /// section: the store-level write lock §5 requires for `index.json`.
    /// Holding `state` across the disk write (rather than cloning and
    /// releasing the lock first) is what makes concurrent pushes/tags
    /// serialize into disk writes in the same order their in-memory
    /// mutations happened, instead of racing an earlier, smaller snapshot
    /// to disk after a later, larger one already won.
    fn write_index(&self) -> Result<()> {
        let state = self.state.lock().unwrap();
        let doc = OnDiskIndex {
            schema_version: 2,
            manifests: state.manifests.clone(),
        };
        self.dir
            .atomic_replace_with(INDEX_FILE, |w| -> Result<()> {
                serde_json::to_writer(w, &doc)?;
                Ok(())
            })?;
        Ok(())
    }

    fn require_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(Error::UnsupportedOperation("read-only layout store"));
        }
        Ok(())
    }

    fn record_manifest(&self, descriptor: &Descriptor) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            state.manifests.push(descriptor.clone());
        }
        for child in graph::successors(self, descriptor)? {
            self.state
                .lock()
                .unwrap()
                .predecessors
                .entry(child.digest.clone())
                .or_default()
                .push(descriptor.clone());
        }
        Ok(())
    }
}

impl Storage for LayoutStore {
    type Reader = Verifier<cap_std::fs::File>;

    fn fetch(&self, descriptor: &Descriptor) -> Result<Self::Reader> {
        let path = descriptor.digest.blob_path();
        let f = self.dir.open(&path).map_err(|_| Error::NotFound)?;
        Verifier::new(f.into_std(), descriptor)
    }

    fn push(&self, descriptor: &Descriptor, content: impl Read) -> Result<()> {
        self.require_writable()?;
        let blob_path = descriptor.digest.blob_path();
        if self.dir.try_exists(&blob_path)? {
            trace!("layout push digest={} already present", descriptor.digest);
            let mut content = content;
            std::io::copy(&mut content, &mut std::io::sink())?;
        } else {
            let mut db = DirBuilder::new();
            db.recursive(true).mode(0o755);
            let alg_dir = format!("blobs/{}", descriptor.digest.algorithm.name());
            self.dir.ensure_dir_with(&alg_dir, &db)?;

            let mut verifier = Verifier::new(content, descriptor)?;
            let mut tmp = cap_tempfile::TempFile::new(&self.dir)?;
            std::io::copy(&mut verifier, tmp.as_file_mut())?;
            verifier.verify()?;
            tmp.replace(&blob_path)?;
            debug!("layout stored new blob digest={}", descriptor.digest);
        }
        if descriptor.is_manifest_like() {
            self.record_manifest(descriptor)?;
            self.write_index()?;
        }
        Ok(())
    }

    fn exists(&self, descriptor: &Descriptor) -> Result<bool> {
        Ok(self.dir.try_exists(descriptor.digest.blob_path())?)
    }
}

impl TagResolver for LayoutStore {
    fn resolve(&self, reference: &str) -> Result<Descriptor> {
        self.state
            .lock()
            .unwrap()
            .tags
            .get(reference)
            .cloned()
            .ok_or(Error::NotFound)
    }

    fn tag(&self, descriptor: &Descriptor, reference: &str) -> Result<()> {
        self.require_writable()?;
        if !self.exists(descriptor)? {
            return Err(Error::NotFound);
        }
        {
            let mut state = self.state.lock().unwrap();
            // Drop any existing entry wearing this tag, and any stale
            // untagged duplicate of this exact descriptor, then re-add
            // a freshly tagged copy.
            state.manifests.retain(|d| d.tag() != Some(reference));
            let mut tagged = descriptor.clone();
            tagged = tagged.with_annotation(ANNOTATION_REF_NAME, reference);
            state.manifests.push(tagged.clone());
            state.tags.insert(reference.to_string(), tagged);
        }
        self.write_index()
    }
}

impl PredecessorFinder for LayoutStore {
    fn predecessors(&self, descriptor: &Descriptor) -> Result<Vec<Descriptor>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .predecessors
            .get(&descriptor.digest)
            .cloned()
            .unwrap_or_default())
    }
}
