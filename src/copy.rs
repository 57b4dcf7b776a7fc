//! Concurrent graph copy: resolve a reference on a source target, walk its
//! manifest sub-graph, and push every node to a destination target with
//! dedup, bounded parallelism, and children-before-parents ordering.
//!
//! Generalizes the worker-pool shape `perunner::worker::Pool` uses for
//! cloud-hypervisor jobs (bounded `crossbeam::channel` + a fixed set of
//! threads) into a dependency-respecting scheduler: a node is only handed
//! to a worker once every descriptor it references has already been
//! pushed to the destination.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use crossbeam::channel;
use log::{debug, trace, warn};

use crate::descriptor::Descriptor;
use crate::digest::Digest;
use crate::error::{Error, Result};
use crate::graph;
use crate::storage::{CancelToken, GraphTarget, Storage};

type Hook<'a> = Box<dyn Fn(&Descriptor) -> Result<()> + Send + Sync + 'a>;
type FindSuccessors<'a, S> = Box<dyn Fn(&S, &Descriptor) -> Result<Vec<Descriptor>> + Send + Sync + 'a>;
type MapRoot<'a, S> = Box<dyn Fn(&S, &Descriptor) -> Result<Descriptor> + Send + Sync + 'a>;

/// Policy hooks and scheduling knobs for [`copy`]. Generic over the source
/// type `S` so `find_successors`/`map_root` can call back into it without
/// an extra trait-object indirection on the hot path.
pub struct CopyOptions<'a, S> {
    /// Upper bound on in-flight blob transfers. Default: 3.
    pub concurrency: usize,
    /// Called before each node transfer. Returning [`Error::SkipDescriptor`]
    /// prunes that single node (its already-discovered children are still
    /// copied; only this node's own transfer is skipped).
    pub pre_copy: Option<Hook<'a>>,
    /// Called after each node is successfully transferred (or found to
    /// already exist and skipped via `on_copy_skipped`, which is called
    /// instead, not in addition).
    pub post_copy: Option<Hook<'a>>,
    /// Called when a node transfer is skipped because it already exists at
    /// the destination.
    pub on_copy_skipped: Option<Hook<'a>>,
    /// Override for successor discovery. Defaults to [`graph::successors`].
    pub find_successors: Option<FindSuccessors<'a, S>>,
    /// Override to rewrite the root descriptor before traversal begins.
    pub map_root: Option<MapRoot<'a, S>>,
    /// Cooperative cancellation signal. A fresh token is created by
    /// `Default` if the caller doesn't supply one of their own (e.g. to
    /// cancel from another thread).
    pub cancel: CancelToken,
}

impl<'a, S> Default for CopyOptions<'a, S> {
    fn default() -> Self {
        Self {
            concurrency: 3,
            pre_copy: None,
            post_copy: None,
            on_copy_skipped: None,
            find_successors: None,
            map_root: None,
            cancel: CancelToken::new(),
        }
    }
}

impl<'a, S> CopyOptions<'a, S> {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_pre_copy(mut self, f: impl Fn(&Descriptor) -> Result<()> + Send + Sync + 'a) -> Self {
        self.pre_copy = Some(Box::new(f));
        self
    }

    pub fn with_post_copy(mut self, f: impl Fn(&Descriptor) -> Result<()> + Send + Sync + 'a) -> Self {
        self.post_copy = Some(Box::new(f));
        self
    }

    pub fn with_on_copy_skipped(mut self, f: impl Fn(&Descriptor) -> Result<()> + Send + Sync + 'a) -> Self {
        self.on_copy_skipped = Some(Box::new(f));
        self
    }

    pub fn with_find_successors(
        mut self,
        f: impl Fn(&S, &Descriptor) -> Result<Vec<Descriptor>> + Send + Sync + 'a,
    ) -> Self {
        self.find_successors = Some(Box::new(f));
        self
    }

    pub fn with_map_root(
        mut self,
        f: impl Fn(&S, &Descriptor) -> Result<Descriptor> + Send + Sync + 'a,
    ) -> Self {
        self.map_root = Some(Box::new(f));
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }
}

struct Node {
    descriptor: Descriptor,
    children: Vec<usize>,
}

/// Identity key used to dedup nodes during discovery: same key as
/// [`Descriptor::identity`], laid out so it can live in a `HashMap` key.
type NodeKey = (String, Digest, u64);

fn discover<S: Storage>(
    source: &S,
    root: &Descriptor,
    find_successors: &dyn Fn(&S, &Descriptor) -> Result<Vec<Descriptor>>,
) -> Result<(Vec<Node>, usize)> {
    let mut nodes: Vec<Node> = Vec::new();
    let mut seen: HashMap<NodeKey, usize> = HashMap::new();

    fn visit<S: Storage>(
        source: &S,
        desc: &Descriptor,
        find_successors: &dyn Fn(&S, &Descriptor) -> Result<Vec<Descriptor>>,
        nodes: &mut Vec<Node>,
        seen: &mut HashMap<NodeKey, usize>,
    ) -> Result<usize> {
        let key = desc.identity();
        if let Some(&id) = seen.get(&key) {
            return Ok(id);
        }
        let id = nodes.len();
        nodes.push(Node {
            descriptor: desc.clone(),
            children: Vec::new(),
        });
        seen.insert(key, id);

        let successors = find_successors(source, desc)?;
        let mut children = Vec::with_capacity(successors.len());
        for child in &successors {
            children.push(visit(source, child, find_successors, nodes, seen)?);
        }
        nodes[id].children = children;
        Ok(id)
    }

    let root_id = visit(source, root, find_successors, &mut nodes, &mut seen)?;
    Ok((nodes, root_id))
}

/// Transfer a single node: `preCopy` → existence check → fetch+push →
/// `postCopy`/`onCopySkipped`. [`Error::SkipDescriptor`] from `preCopy` and
/// [`Error::AlreadyExists`] from a racing push are both recovered here as
/// success, per §4.7/§7 of the design.
fn transfer_node<S: GraphTarget, D: GraphTarget>(
    source: &S,
    destination: &D,
    desc: &Descriptor,
    options: &CopyOptions<S>,
) -> Result<()> {
    options.cancel.check()?;

    if let Some(pre) = &options.pre_copy {
        match pre(desc) {
            Ok(()) => {}
            Err(e) if e.is_skip_descriptor() => {
                trace!("copy: preCopy skipped digest={}", desc.digest);
                return Ok(());
            }
            Err(e) => return Err(e),
        }
    }

    if destination.exists(desc)? {
        debug!("copy: already present at destination digest={}", desc.digest);
        if let Some(on_skip) = &options.on_copy_skipped {
            on_skip(desc)?;
        }
        return Ok(());
    }

    let reader = source.fetch(desc)?;
    match destination.push(desc, reader) {
        Ok(()) => {}
        Err(e) if e.is_already_exists() => {
            trace!("copy: push raced with another writer digest={}", desc.digest);
        }
        Err(e) => return Err(e),
    }

    if let Some(post) = &options.post_copy {
        post(desc)?;
    }
    debug!("copy: transferred digest={} size={}", desc.digest, desc.size);
    Ok(())
}

enum Msg {
    Work(usize),
    Stop,
}

/// Broadcast one [`Msg::Stop`] per worker so every thread parked in
/// `recv()` wakes up and exits, exactly once regardless of whether the
/// normal completion path or the error path got here first.
fn broadcast_stop(tx: &channel::Sender<Msg>, concurrency: usize, stopped: &AtomicBool) {
    if stopped
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_ok()
    {
        for _ in 0..concurrency {
            let _ = tx.send(Msg::Stop);
        }
    }
}

/// Resolve `src_ref` on `source`, copy its reachable manifest sub-graph to
/// `destination` (deduplicated, children before parents, up to
/// `options.concurrency` transfers in flight at once), tag the root as
/// `dst_ref` on `destination` if given, and return the (possibly
/// `map_root`-rewritten) root descriptor.
///
/// Any node transfer failure other than [`Error::AlreadyExists`] cancels
/// outstanding work and is returned; partially-copied content from the
/// failed run is left in place (the backends' own push semantics are
/// idempotent or digest-identified, so a retried copy resumes cheaply).
pub fn copy<S, D>(
    source: &S,
    destination: &D,
    src_ref: &str,
    dst_ref: Option<&str>,
    options: CopyOptions<S>,
) -> Result<Descriptor>
where
    S: GraphTarget + Sync,
    D: GraphTarget + Sync,
{
    options.cancel.check()?;

    let resolved = source.resolve(src_ref)?;
    let root = match &options.map_root {
        Some(map_root) => map_root(source, &resolved)?,
        None => resolved,
    };

    let default_find_successors = |s: &S, d: &Descriptor| graph::successors(s, d);
    let find_successors: &dyn Fn(&S, &Descriptor) -> Result<Vec<Descriptor>> = options
        .find_successors
        .as_deref()
        .unwrap_or(&default_find_successors);

    let (nodes, root_id) = discover(source, &root, find_successors)?;
    let total = nodes.len();
    debug!(
        "copy: discovered {} node(s) reachable from '{}'",
        total, src_ref
    );
    if total == 0 {
        return Ok(root);
    }
    let _ = root_id; // root is always node 0 by construction of `visit`.

    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); total];
    let mut pending_counts: Vec<usize> = Vec::with_capacity(total);
    for (i, node) in nodes.iter().enumerate() {
        pending_counts.push(node.children.len());
        for &child in &node.children {
            dependents[child].push(i);
        }
    }
    let pending: Vec<AtomicUsize> = pending_counts.into_iter().map(AtomicUsize::new).collect();
    let remaining = AtomicUsize::new(total);
    let stopped = AtomicBool::new(false);
    let first_error: Mutex<Option<Error>> = Mutex::new(None);

    let concurrency = options.concurrency.max(1).min(total);
    let (work_tx, work_rx) = channel::unbounded::<Msg>();
    for (i, node) in nodes.iter().enumerate() {
        if node.children.is_empty() {
            work_tx.send(Msg::Work(i)).expect("receivers outlive this send");
        }
    }

    std::thread::scope(|scope| {
        for worker in 0..concurrency {
            let work_tx = work_tx.clone();
            let work_rx = work_rx.clone();
            let nodes = &nodes;
            let dependents = &dependents;
            let pending = &pending;
            let remaining = &remaining;
            let stopped = &stopped;
            let first_error = &first_error;
            let options = &options;
            scope.spawn(move || loop {
                match work_rx.recv() {
                    Err(_) | Ok(Msg::Stop) => break,
                    Ok(Msg::Work(idx)) => {
                        if options.cancel.is_cancelled() {
                            trace!("copy: worker {} skipping node, cancelled", worker);
                            broadcast_stop(&work_tx, concurrency, stopped);
                            continue;
                        }
                        let desc = &nodes[idx].descriptor;
                        match transfer_node(source, destination, desc, options) {
                            Ok(()) => {
                                for &parent in &dependents[idx] {
                                    if pending[parent].fetch_sub(1, Ordering::SeqCst) == 1 {
                                        let _ = work_tx.send(Msg::Work(parent));
                                    }
                                }
                                if remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
                                    broadcast_stop(&work_tx, concurrency, stopped);
                                }
                            }
                            Err(e) => {
                                warn!("copy: node transfer failed digest={}: {e}", desc.digest);
                                let mut fe = first_error.lock().unwrap();
                                if fe.is_none() {
                                    *fe = Some(e);
                                }
                                drop(fe);
                                options.cancel.cancel();
                                broadcast_stop(&work_tx, concurrency, stopped);
                            }
                        }
                    }
                }
            });
        }
    });

    if let Some(err) = first_error.into_inner().unwrap() {
        return Err(err);
    }

    if let Some(reference) = dst_ref {
        destination.tag(&root, reference)?;
    }
    Ok(root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{descriptor_from_bytes, MEDIA_TYPE_IMAGE_MANIFEST};
    use crate::memory::MemoryStore;
    use std::sync::Arc;

    fn push_manifest(store: &MemoryStore, config: &Descriptor, layers: &[Descriptor]) -> Descriptor {
        #[derive(serde::Serialize)]
        struct Manifest<'a> {
            #[serde(rename = "schemaVersion")]
            schema_version: u32,
            config: &'a Descriptor,
            layers: &'a [Descriptor],
        }
        let manifest = Manifest {
            schema_version: 2,
            config,
            layers,
        };
        let bytes = serde_json::to_vec(&manifest).unwrap();
        let desc = descriptor_from_bytes(MEDIA_TYPE_IMAGE_MANIFEST, &bytes).unwrap();
        store.push(&desc, &bytes[..]).unwrap();
        desc
    }

    #[test]
    fn e4_graph_copy_memory_to_memory() {
        let src = MemoryStore::new();
        let config_bytes = b"{}";
        let config = descriptor_from_bytes("application/vnd.oci.image.config.v1+json", config_bytes).unwrap();
        src.push(&config, &config_bytes[..]).unwrap();
        let layer_bytes = b"foobar";
        let layer = descriptor_from_bytes("application/vnd.oci.image.layer.v1.tar", layer_bytes).unwrap();
        src.push(&layer, &layer_bytes[..]).unwrap();
        let manifest = push_manifest(&src, &config, std::slice::from_ref(&layer));
        src.tag(&manifest, "latest").unwrap();

        let dst = MemoryStore::new();
        let root = copy(&src, &dst, "latest", Some("latest"), CopyOptions::default()).unwrap();
        assert_eq!(root, manifest);

        assert!(dst.exists(&config).unwrap());
        assert!(dst.exists(&layer).unwrap());
        assert!(dst.exists(&manifest).unwrap());
        assert_eq!(dst.resolve("latest").unwrap(), manifest);
        assert_eq!(dst.predecessors(&layer).unwrap(), vec![manifest]);
    }

    #[test]
    fn copy_is_idempotent_on_rerun() {
        let src = MemoryStore::new();
        let config_bytes = b"{}";
        let config = descriptor_from_bytes("application/vnd.oci.image.config.v1+json", config_bytes).unwrap();
        src.push(&config, &config_bytes[..]).unwrap();
        let manifest = push_manifest(&src, &config, &[]);
        src.tag(&manifest, "latest").unwrap();

        let dst = MemoryStore::new();
        copy(&src, &dst, "latest", None, CopyOptions::default()).unwrap();
        // Second run: everything already exists at the destination.
        copy(&src, &dst, "latest", None, CopyOptions::default()).unwrap();
        assert!(dst.exists(&manifest).unwrap());
    }

    #[test]
    fn pre_copy_skip_descriptor_prunes_single_node() {
        let src = MemoryStore::new();
        let config_bytes = b"{}";
        let config = descriptor_from_bytes("application/vnd.oci.image.config.v1+json", config_bytes).unwrap();
        src.push(&config, &config_bytes[..]).unwrap();
        let layer_bytes = b"foobar";
        let layer = descriptor_from_bytes("application/vnd.oci.image.layer.v1.tar", layer_bytes).unwrap();
        src.push(&layer, &layer_bytes[..]).unwrap();
        let manifest = push_manifest(&src, &config, std::slice::from_ref(&layer));
        src.tag(&manifest, "latest").unwrap();

        let dst = MemoryStore::new();
        let skipped_digest = layer.digest.clone();
        let options = CopyOptions::default().with_pre_copy(move |d: &Descriptor| {
            if d.digest == skipped_digest {
                Err(Error::SkipDescriptor)
            } else {
                Ok(())
            }
        });
        copy(&src, &dst, "latest", None, options).unwrap();
        assert!(!dst.exists(&layer).unwrap());
        assert!(dst.exists(&config).unwrap());
        assert!(dst.exists(&manifest).unwrap());
    }

    #[test]
    fn on_copy_skipped_fires_when_already_present() {
        let src = MemoryStore::new();
        let bytes = b"hello world";
        let desc = descriptor_from_bytes("application/vnd.oci.image.layer.v1.tar", bytes).unwrap();
        src.push(&desc, &bytes[..]).unwrap();
        src.tag(&desc, "blob").unwrap();

        let dst = MemoryStore::new();
        dst.push(&desc, &bytes[..]).unwrap();

        let hit = Arc::new(AtomicUsize::new(0));
        let hit2 = hit.clone();
        let options = CopyOptions::default().with_on_copy_skipped(move |_| {
            hit2.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        copy(&src, &dst, "blob", None, options).unwrap();
        assert_eq!(hit.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrent_copy_respects_dependency_order() {
        let _ = env_logger::try_init();
        let src = MemoryStore::new();
        let config_bytes = b"{}";
        let config = descriptor_from_bytes("application/vnd.oci.image.config.v1+json", config_bytes).unwrap();
        src.push(&config, &config_bytes[..]).unwrap();
        let mut layers = Vec::new();
        for i in 0..8u8 {
            let bytes = vec![i; 32];
            let desc = descriptor_from_bytes("application/vnd.oci.image.layer.v1.tar", &bytes).unwrap();
            src.push(&desc, &bytes[..]).unwrap();
            layers.push(desc);
        }
        let manifest = push_manifest(&src, &config, &layers);
        src.tag(&manifest, "latest").unwrap();

        let dst = MemoryStore::new();
        let options = CopyOptions::default().with_concurrency(4);
        copy(&src, &dst, "latest", None, options).unwrap();
        for l in &layers {
            assert!(dst.exists(l).unwrap());
        }
        assert!(dst.exists(&manifest).unwrap());
    }
}
