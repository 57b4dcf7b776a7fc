//! Tar+gzip packing and unpacking for the directory side of
//! [`super::FilePackStore::add`]. Generalizes `ocidir`'s
//! `GzipLayerWriter`/`create_layer` (built for container image layers)
//! into packing an arbitrary directory tree.

use std::fs;
use std::io::Write;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;

use crate::error::Result;

pub struct Packed {
    pub tar: Vec<u8>,
    pub compressed: Vec<u8>,
}

/// Pack `dir`'s contents into a tar stream, then gzip it. When
/// `reproducible` is set, entries are visited in sorted relative-path
/// order with zeroed mtime/uid/gid so packing the same directory twice
/// yields byte-identical output.
pub fn pack_directory(dir: &Path, reproducible: bool) -> Result<Packed> {
    let mut entries = Vec::new();
    collect_entries(dir, Path::new(""), &mut entries)?;
    if reproducible {
        entries.sort();
    }

    let mut tar = Vec::new();
    {
        let mut builder = tar::Builder::new(&mut tar);
        for rel in &entries {
            let abs = dir.join(rel);
            let metadata = fs::symlink_metadata(&abs)?;
            let mut header = tar::Header::new_gnu();
            header.set_mode(metadata.permissions().mode());
            if reproducible {
                header.set_mtime(0);
                header.set_uid(0);
                header.set_gid(0);
            } else {
                header.set_mtime(metadata.mtime().max(0) as u64);
                header.set_uid(metadata.uid() as u64);
                header.set_gid(metadata.gid() as u64);
            }
            if metadata.file_type().is_symlink() {
                let target = fs::read_link(&abs)?;
                header.set_entry_type(tar::EntryType::Symlink);
                header.set_size(0);
                builder.append_link(&mut header, rel, &target)?;
            } else if metadata.is_dir() {
                header.set_entry_type(tar::EntryType::Directory);
                header.set_size(0);
                builder.append_data(&mut header, rel, std::io::empty())?;
            } else {
                header.set_entry_type(tar::EntryType::Regular);
                header.set_size(metadata.len());
                let f = fs::File::open(&abs)?;
                builder.append_data(&mut header, rel, f)?;
            }
        }
        builder.finish()?;
    }

    let mut encoder = GzEncoder::new(Vec::with_capacity(tar.len() / 2 + 64), Compression::default());
    encoder.write_all(&tar)?;
    let compressed = encoder.finish()?;

    Ok(Packed { tar, compressed })
}

/// Extract a tar+gzip stream (as produced by [`pack_directory`]) into
/// `target`, which must already exist. Symlinks are written verbatim.
pub fn unpack_directory(gz_bytes: &[u8], target: &Path) -> Result<()> {
    let decoder = flate2::read::GzDecoder::new(gz_bytes);
    let mut archive = tar::Archive::new(decoder);
    for entry in archive.entries()? {
        let mut entry = entry?;
        let rel = entry.path()?.to_path_buf();
        if rel.components().any(|c| matches!(c, std::path::Component::ParentDir)) {
            return Err(crate::error::Error::PathTraversalDisallowed(
                rel.display().to_string(),
            ));
        }
        let dest = target.join(&rel);
        // A stale symlink left over from a prior unpack must be removed
        // before writing on top of it: `symlink()` (and plain file create)
        // both fail with `EEXIST` against an existing link, unlike a
        // regular file open-for-write.
        if let Ok(meta) = fs::symlink_metadata(&dest) {
            if meta.file_type().is_symlink() {
                fs::remove_file(&dest)?;
            }
        }
        entry.unpack(&dest)?;
    }
    Ok(())
}

fn collect_entries(root: &Path, rel: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    let abs = root.join(rel);
    for entry in fs::read_dir(&abs)? {
        let entry = entry?;
        let entry_rel = rel.join(entry.file_name());
        let file_type = entry.file_type()?;
        out.push(entry_rel.clone());
        if file_type.is_dir() {
            collect_entries(root, &entry_rel, out)?;
        }
    }
    Ok(())
}
