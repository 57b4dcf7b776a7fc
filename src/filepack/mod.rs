//! A store whose working directory holds user files and directories,
//! presented as OCI content without unnecessary copying. Manifests are
//! held in an embedded [`MemoryStore`]; named blobs map onto real paths
//! under the working directory.

mod pack;

use std::collections::HashMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use log::{debug, trace};

use crate::descriptor::{
    descriptor_from_bytes, Descriptor, ANNOTATION_INNER_DIGEST, ANNOTATION_TITLE,
    ANNOTATION_UNPACK, MEDIA_TYPE_IMAGE_CONFIG, MEDIA_TYPE_IMAGE_LAYER,
    MEDIA_TYPE_IMAGE_LAYER_GZIP, MEDIA_TYPE_IMAGE_MANIFEST,
};
use crate::digest::{hash_reader, Algorithm, Digest};
use crate::error::{Error, Result};
use crate::lock::KeyedLock;
use crate::memory::MemoryStore;
use crate::storage::{PredecessorFinder, Storage, TagResolver};

/// Policy knobs for a [`FilePackStore`]. `Default` matches the safest,
/// most surprising-free behavior: no traversal, no silent overwrite, name
/// required.
#[derive(Debug, Clone)]
pub struct FilePackOptions {
    pub allow_path_traversal_on_write: bool,
    pub disable_overwrite: bool,
    pub ignore_no_name: bool,
    /// Whether `add()` on a directory produces a byte-identical tar
    /// stream across runs (sorted entries, zeroed mtime/uid/gid).
    pub reproducible: bool,
}

impl Default for FilePackOptions {
    fn default() -> Self {
        Self {
            allow_path_traversal_on_write: false,
            disable_overwrite: false,
            ignore_no_name: false,
            reproducible: false,
        }
    }
}

/// Per-call knobs for [`FilePackStore::pack`]. `Default` packs every file
/// under its own inferred media type and pushes an empty JSON config.
#[derive(Debug, Clone, Default)]
pub struct PackOptions {
    /// Media type applied to every layer added from `files`. `None` keeps
    /// each layer's own default (the regular-file/directory inference
    /// [`FilePackStore::add`] already performs).
    pub layer_media_type: Option<String>,
    /// Bytes pushed as the manifest's `config` descriptor. `None` pushes
    /// the default empty JSON object `{}`.
    pub config_bytes: Option<Vec<u8>>,
    /// Media type for the pushed config descriptor. Defaults to
    /// `application/vnd.oci.image.config.v1+json`.
    pub config_media_type: Option<String>,
}

#[derive(Clone)]
struct NamedEntry {
    path: PathBuf,
    digest: Digest,
}

pub struct FilePackStore {
    root: PathBuf,
    options: FilePackOptions,
    manifests: MemoryStore,
    named: Mutex<HashMap<String, NamedEntry>>,
    anonymous: Mutex<HashMap<Digest, PathBuf>>,
    locks: KeyedLock<String>,
    temps: Mutex<Vec<PathBuf>>,
}

impl FilePackStore {
    pub fn new(root: impl Into<PathBuf>, options: FilePackOptions) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        let root = fs::canonicalize(&root)?;
        Ok(Self {
            root,
            options,
            manifests: MemoryStore::new(),
            named: Mutex::new(HashMap::new()),
            anonymous: Mutex::new(HashMap::new()),
            locks: KeyedLock::new(),
            temps: Mutex::new(Vec::new()),
        })
    }

    /// Resolve `name` to an absolute path under the working directory,
    /// applying the path-traversal policy.
    fn resolve_write_path(&self, name: &str) -> Result<PathBuf> {
        let candidate = self.root.join(name);
        let escapes = match candidate.strip_prefix(&self.root) {
            Ok(rel) => rel.components().any(|c| matches!(c, std::path::Component::ParentDir)),
            Err(_) => true,
        };
        if escapes && !self.options.allow_path_traversal_on_write {
            return Err(Error::PathTraversalDisallowed(name.to_string()));
        }
        Ok(candidate)
    }

    /// Register a file or directory at `path` under the logical name
    /// `name`. Files are referenced in place; directories are packed into
    /// a tar+gzip blob.
    pub fn add(&self, name: &str, media_type: Option<&str>, path: &Path) -> Result<Descriptor> {
        if self.named.lock().unwrap().contains_key(name) {
            return Err(Error::DuplicateName(name.to_string()));
        }
        let metadata = fs::metadata(path)?;
        let descriptor = if metadata.is_dir() {
            let packed = pack::pack_directory(path, self.options.reproducible)?;
            let outer_digest = Digest::compute(Algorithm::Sha256, &packed.compressed)?;
            let inner_digest = Digest::compute(Algorithm::Sha256, &packed.tar)?;
            let mt = media_type.unwrap_or(MEDIA_TYPE_IMAGE_LAYER_GZIP);
            let dest = self.stage_bytes(&packed.compressed)?;
            self.named.lock().unwrap().insert(
                name.to_string(),
                NamedEntry {
                    path: dest,
                    digest: outer_digest.clone(),
                },
            );
            Descriptor::new(mt, outer_digest, packed.compressed.len() as u64)
                .with_annotation(ANNOTATION_TITLE, name)
                .with_annotation(ANNOTATION_UNPACK, "true")
                .with_annotation(ANNOTATION_INNER_DIGEST, inner_digest.to_string())
        } else {
            let mut f = fs::File::open(path)?;
            let (digest, size) = hash_reader(Algorithm::Sha256, &mut f)?;
            let mt = media_type.unwrap_or(MEDIA_TYPE_IMAGE_LAYER);
            self.named.lock().unwrap().insert(
                name.to_string(),
                NamedEntry {
                    path: path.to_path_buf(),
                    digest: digest.clone(),
                },
            );
            Descriptor::new(mt, digest, size).with_annotation(ANNOTATION_TITLE, name)
        };
        debug!("filepack add name={} digest={}", name, descriptor.digest);
        Ok(descriptor)
    }

    fn stage_bytes(&self, bytes: &[u8]) -> Result<PathBuf> {
        let tmp = tempfile_path(&self.root)?;
        fs::write(&tmp, bytes)?;
        self.temps.lock().unwrap().push(tmp.clone());
        Ok(tmp)
    }

    /// Add each file, composes an image manifest referencing them as
    /// layers, pushes a config, and returns the manifest descriptor.
    /// `config_name`, if given, binds the pushed config under that logical
    /// name the same way a named blob is bound; otherwise it is pushed
    /// anonymously, indexed by digest.
    pub fn pack(
        &self,
        files: &[(&str, &Path)],
        opts: PackOptions,
        manifest_name: Option<&str>,
        config_name: Option<&str>,
    ) -> Result<Descriptor> {
        let mut layers = Vec::with_capacity(files.len());
        for (name, path) in files {
            layers.push(self.add(name, opts.layer_media_type.as_deref(), path)?);
        }

        let config_bytes = opts.config_bytes.unwrap_or_else(|| b"{}".to_vec());
        let config_media_type = opts
            .config_media_type
            .as_deref()
            .unwrap_or(MEDIA_TYPE_IMAGE_CONFIG)
            .to_string();
        let mut config = descriptor_from_bytes(config_media_type, &config_bytes)?;
        match config_name {
            Some(name) => {
                config = config.with_annotation(ANNOTATION_TITLE, name);
                self.push_named(&config, &config_bytes[..], name)?;
            }
            None => self.push_anonymous_bytes(&config, &config_bytes)?,
        }

        #[derive(serde::Serialize)]
        struct Manifest<'a> {
            #[serde(rename = "schemaVersion")]
            schema_version: u32,
            config: &'a Descriptor,
            layers: &'a [Descriptor],
        }
        let manifest = Manifest {
            schema_version: 2,
            config: &config,
            layers: &layers,
        };
        let manifest_bytes = serde_json::to_vec(&manifest)?;
        let manifest_desc = descriptor_from_bytes(MEDIA_TYPE_IMAGE_MANIFEST, &manifest_bytes)?;
        self.push(&manifest_desc, &manifest_bytes[..])?;
        if let Some(tag) = manifest_name {
            self.tag(&manifest_desc, tag)?;
        }
        Ok(manifest_desc)
    }

    /// Store `bytes` under `descriptor`'s digest without requiring a
    /// title, bypassing the `ignoreNoName` policy check a raw external
    /// `push` would apply: `pack`'s own default config is trusted content
    /// this store just hashed itself, not caller-supplied input.
    fn push_anonymous_bytes(&self, descriptor: &Descriptor, bytes: &[u8]) -> Result<()> {
        let tmp = tempfile_path(&self.root)?;
        fs::write(&tmp, bytes)?;
        self.temps.lock().unwrap().push(tmp.clone());
        self.anonymous.lock().unwrap().insert(descriptor.digest.clone(), tmp);
        Ok(())
    }

    /// Remove every temporary file this store created. Best-effort: all
    /// removal failures are collected into a single composite error.
    pub fn close(self) -> Result<()> {
        let temps = self.temps.into_inner().unwrap();
        let mut failures = Vec::new();
        for t in temps {
            if let Err(e) = fs::remove_file(&t) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    failures.push(format!("{}: {}", t.display(), e));
                }
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::Io(std::io::Error::other(failures.join("; "))))
        }
    }

    fn push_named(&self, descriptor: &Descriptor, content: impl Read, name: &str) -> Result<()> {
        self.locks.with_lock(&name.to_string(), || {
            if let Some(existing) = self.named.lock().unwrap().get(name).cloned() {
                // Another writer already bound this name: this call is a
                // race loser, not a fresh write. Drain the reader (the
                // caller is still obligated to finish it) and report
                // failure rather than silently succeeding.
                let mut content = content;
                std::io::copy(&mut content, &mut std::io::sink())?;
                if existing.digest != descriptor.digest {
                    return Err(Error::DuplicateName(name.to_string()));
                }
                trace!("filepack push race-loser name={} digest={}", name, descriptor.digest);
                return Err(Error::AlreadyExists);
            }
            let target = self.resolve_write_path(name)?;
            if self.options.disable_overwrite && target.exists() {
                return Err(Error::OverwriteDisallowed(name.to_string()));
            }
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            let unpack = descriptor.annotation(ANNOTATION_UNPACK) == Some("true");
            if unpack {
                let bytes = crate::digest::read_all(content, descriptor)?;
                if let Some(p) = target.parent() {
                    fs::create_dir_all(p)?;
                }
                fs::create_dir_all(&target)?;
                pack::unpack_directory(&bytes, &target)?;
            } else {
                let mut verifier = crate::digest::Verifier::new(content, descriptor)?;
                let mut f = fs::File::create(&target)?;
                std::io::copy(&mut verifier, &mut f)?;
                verifier.verify()?;
            }
            self.named.lock().unwrap().insert(
                name.to_string(),
                NamedEntry {
                    path: target,
                    digest: descriptor.digest.clone(),
                },
            );
            Ok(())
        })
    }
}

impl Storage for FilePackStore {
    type Reader = Box<dyn Read>;

    fn fetch(&self, descriptor: &Descriptor) -> Result<Self::Reader> {
        if descriptor.is_manifest_like() {
            let r = self.manifests.fetch(descriptor)?;
            return Ok(Box::new(r));
        }
        if let Some(entry) = self
            .named
            .lock()
            .unwrap()
            .values()
            .find(|e| e.digest == descriptor.digest)
            .cloned()
        {
            let f = fs::File::open(&entry.path)?;
            return Ok(Box::new(crate::digest::Verifier::new(f, descriptor)?));
        }
        if let Some(path) = self.anonymous.lock().unwrap().get(&descriptor.digest).cloned() {
            let f = fs::File::open(&path)?;
            return Ok(Box::new(crate::digest::Verifier::new(f, descriptor)?));
        }
        Err(Error::NotFound)
    }

    fn push(&self, descriptor: &Descriptor, content: impl Read) -> Result<()> {
        if descriptor.is_manifest_like() {
            return self.manifests.push(descriptor, content);
        }
        if let Some(title) = descriptor.title() {
            return self.push_named(descriptor, content, title);
        }
        if !self.options.ignore_no_name {
            return Err(Error::MissingName);
        }
        trace!("filepack anonymous push digest={}", descriptor.digest);
        let tmp = tempfile_path(&self.root)?;
        let mut verifier = crate::digest::Verifier::new(content, descriptor)?;
        let mut f = fs::File::create(&tmp)?;
        std::io::copy(&mut verifier, &mut f)?;
        verifier.verify()?;
        self.temps.lock().unwrap().push(tmp.clone());
        self.anonymous.lock().unwrap().insert(descriptor.digest.clone(), tmp);
        Ok(())
    }

    fn exists(&self, descriptor: &Descriptor) -> Result<bool> {
        if descriptor.is_manifest_like() {
            return self.manifests.exists(descriptor);
        }
        Ok(self
            .named
            .lock()
            .unwrap()
            .values()
            .any(|e| e.digest == descriptor.digest)
            || self.anonymous.lock().unwrap().contains_key(&descriptor.digest))
    }
}

impl TagResolver for FilePackStore {
    fn resolve(&self, reference: &str) -> Result<Descriptor> {
        self.manifests.resolve(reference)
    }

    fn tag(&self, descriptor: &Descriptor, reference: &str) -> Result<()> {
        self.manifests.tag(descriptor, reference)
    }
}

impl PredecessorFinder for FilePackStore {
    fn predecessors(&self, descriptor: &Descriptor) -> Result<Vec<Descriptor>> {
        self.manifests.predecessors(descriptor)
    }
}

fn tempfile_path(root: &Path) -> Result<PathBuf> {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    let pid = std::process::id();
    Ok(root.join(format!(".occas-tmp-{pid}-{n}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn store(opts: FilePackOptions) -> (tempfile::TempDir, FilePackStore) {
        let td = tempfile::tempdir().unwrap();
        let fp = FilePackStore::new(td.path(), opts).unwrap();
        (td, fp)
    }

    #[test]
    fn e5_duplicate_name_rejected() {
        let (td, fp) = store(FilePackOptions::default());
        let file_path = td.path().join("test.txt");
        fs::write(&file_path, b"hello world").unwrap();
        let desc = fp.add("test.txt", None, &file_path).unwrap();
        // `add` already bound "test.txt"; pushing the identical descriptor
        // again is a race loser against that binding, not a fresh write.
        assert!(matches!(
            fp.push(&desc, &b"hello world"[..]),
            Err(Error::AlreadyExists)
        ));

        let other = descriptor_from_bytes(MEDIA_TYPE_IMAGE_LAYER, b"different").unwrap();
        let other = other.with_annotation(ANNOTATION_TITLE, "test.txt");
        let err = fp.push(&other, &b"different"[..]).unwrap_err();
        assert!(matches!(err, Error::DuplicateName(_)));
    }

    #[test]
    fn e6_path_traversal_disallowed_then_allowed() {
        let (_td, fp) = store(FilePackOptions::default());
        let bytes = b"escape";
        let desc = descriptor_from_bytes(MEDIA_TYPE_IMAGE_LAYER, bytes)
            .unwrap()
            .with_annotation(ANNOTATION_TITLE, "../escape.txt");
        let err = fp.push(&desc, &bytes[..]).unwrap_err();
        assert!(matches!(err, Error::PathTraversalDisallowed(_)));

        let (_td2, fp2) = store(FilePackOptions {
            allow_path_traversal_on_write: true,
            ..Default::default()
        });
        fp2.push(&desc, &bytes[..]).unwrap();
    }

    #[test]
    fn e7_directory_pack_and_unpack_round_trip() {
        let (src_td, fp_src) = store(FilePackOptions::default());
        let dir_path = src_td.path().join("payload");
        fs::create_dir_all(&dir_path).unwrap();
        let mut f = fs::File::create(dir_path.join("test.txt")).unwrap();
        f.write_all(b"hello world").unwrap();
        drop(f);

        let desc = fp_src.add("payload", None, &dir_path).unwrap();
        assert_eq!(desc.annotation(ANNOTATION_UNPACK), Some("true"));

        let mut reader = fp_src.fetch(&desc).unwrap();
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes).unwrap();

        let (dst_td, fp_dst) = store(FilePackOptions::default());
        fp_dst.push(&desc, &bytes[..]).unwrap();

        let unpacked = dst_td.path().join("payload").join("test.txt");
        assert_eq!(fs::read(unpacked).unwrap(), b"hello world");
    }

    #[test]
    fn e8_concurrent_push_dedup() {
        use std::sync::Arc;
        use std::thread;

        // 64 concurrent first-time pushes of the same descriptor+title: per
        // the concurrency policy, exactly one wins and the rest observe
        // `AlreadyExists`/`DuplicateName`.
        let (_td, fp) = store(FilePackOptions::default());
        let fp = Arc::new(fp);
        let bytes: &'static [u8] = b"payload";
        let desc = descriptor_from_bytes(MEDIA_TYPE_IMAGE_LAYER, bytes)
            .unwrap()
            .with_annotation(ANNOTATION_TITLE, "shared.bin");
        let desc = Arc::new(desc);

        let mut handles = Vec::new();
        for _ in 0..64 {
            let fp = fp.clone();
            let desc = desc.clone();
            handles.push(thread::spawn(move || fp.push(&desc, bytes)));
        }
        let mut wins = 0;
        let mut losses = 0;
        for h in handles {
            match h.join().unwrap() {
                Ok(()) => wins += 1,
                Err(Error::AlreadyExists) | Err(Error::DuplicateName(_)) => losses += 1,
                Err(e) => panic!("unexpected error: {e:?}"),
            }
        }
        assert_eq!(wins, 1);
        assert_eq!(losses, 63);
        assert!(fp.exists(&desc).unwrap());
    }

    #[test]
    fn pack_binds_named_config_and_custom_media_types() {
        let (td, fp) = store(FilePackOptions::default());
        let file_path = td.path().join("layer.bin");
        fs::write(&file_path, b"layer bytes").unwrap();

        let opts = PackOptions {
            layer_media_type: Some(MEDIA_TYPE_IMAGE_LAYER.to_string()),
            config_bytes: Some(br#"{"architecture":"amd64"}"#.to_vec()),
            config_media_type: None,
        };
        let manifest = fp
            .pack(&[("layer.bin", &file_path)], opts, Some("latest"), Some("config.json"))
            .unwrap();

        assert!(fp.exists(&manifest).unwrap());
        assert_eq!(fp.resolve("latest").unwrap(), manifest);
        // The config was bound under "config.json": it's a real file under
        // the working directory, not an anonymous temp.
        let config_path = td.path().join("config.json");
        assert_eq!(
            fs::read(&config_path).unwrap(),
            br#"{"architecture":"amd64"}"#
        );
    }

    #[test]
    fn pack_without_config_name_pushes_config_anonymously() {
        let (td, fp) = store(FilePackOptions::default());
        let file_path = td.path().join("layer.bin");
        fs::write(&file_path, b"layer bytes").unwrap();

        let manifest = fp
            .pack(&[("layer.bin", &file_path)], PackOptions::default(), None, None)
            .unwrap();
        assert!(fp.exists(&manifest).unwrap());
        // No "config.json"-style file was written under the working dir
        // for the default empty config; it's indexed by digest only.
        assert!(!td.path().join("config").exists());
    }
}
