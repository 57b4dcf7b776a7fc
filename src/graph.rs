//! Parsing recognized manifest media types and extracting their children
//! (successors), and the reverse (predecessor) relationship backends
//! maintain from that same parse.

use serde::{Deserialize, Serialize};

use crate::descriptor::{
    Descriptor, MEDIA_TYPE_ARTIFACT_MANIFEST, MEDIA_TYPE_DOCKER_MANIFEST,
    MEDIA_TYPE_DOCKER_MANIFEST_LIST, MEDIA_TYPE_IMAGE_INDEX, MEDIA_TYPE_IMAGE_MANIFEST,
};
use crate::error::{Error, Result};
use crate::storage::Storage;

#[derive(Debug, Serialize, Deserialize)]
struct ImageManifest {
    #[serde(rename = "schemaVersion")]
    #[allow(dead_code)]
    schema_version: u32,
    config: Descriptor,
    layers: Vec<Descriptor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    subject: Option<Descriptor>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ImageIndex {
    #[serde(rename = "schemaVersion")]
    #[allow(dead_code)]
    schema_version: u32,
    manifests: Vec<Descriptor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    subject: Option<Descriptor>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ArtifactManifest {
    #[serde(rename = "mediaType")]
    #[allow(dead_code)]
    media_type: String,
    #[serde(rename = "artifactType", skip_serializing_if = "Option::is_none")]
    #[allow(dead_code)]
    artifact_type: Option<String>,
    blobs: Vec<Descriptor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    subject: Option<Descriptor>,
}

#[derive(Debug, Serialize, Deserialize)]
struct DockerManifest {
    config: Descriptor,
    layers: Vec<Descriptor>,
}

#[derive(Debug, Serialize, Deserialize)]
struct DockerManifestList {
    manifests: Vec<Descriptor>,
}

/// The ordered list of descriptors directly reachable from `descriptor`,
/// dispatched on its media type. Anything not recognized here is a leaf.
pub fn successors<S: Storage>(storage: &S, descriptor: &Descriptor) -> Result<Vec<Descriptor>> {
    if !descriptor.is_manifest_like() {
        return Ok(Vec::new());
    }
    let reader = storage.fetch(descriptor)?;
    let bytes = crate::digest::read_all(reader, descriptor)?;

    match descriptor.media_type.as_str() {
        MEDIA_TYPE_IMAGE_MANIFEST => {
            let m: ImageManifest = serde_json::from_slice(&bytes)
                .map_err(|e| Error::InvalidManifest(e.to_string()))?;
            let mut out = Vec::with_capacity(m.layers.len() + 2);
            if let Some(subject) = m.subject {
                out.push(subject);
            }
            out.push(m.config);
            out.extend(m.layers);
            Ok(out)
        }
        MEDIA_TYPE_IMAGE_INDEX => {
            let idx: ImageIndex = serde_json::from_slice(&bytes)
                .map_err(|e| Error::InvalidManifest(e.to_string()))?;
            let mut out = Vec::with_capacity(idx.manifests.len() + 1);
            if let Some(subject) = idx.subject {
                out.push(subject);
            }
            out.extend(idx.manifests);
            Ok(out)
        }
        MEDIA_TYPE_ARTIFACT_MANIFEST => {
            let am: ArtifactManifest = serde_json::from_slice(&bytes)
                .map_err(|e| Error::InvalidManifest(e.to_string()))?;
            let mut out = Vec::with_capacity(am.blobs.len() + 1);
            if let Some(subject) = am.subject {
                out.push(subject);
            }
            out.extend(am.blobs);
            Ok(out)
        }
        MEDIA_TYPE_DOCKER_MANIFEST => {
            let dm: DockerManifest = serde_json::from_slice(&bytes)
                .map_err(|e| Error::InvalidManifest(e.to_string()))?;
            let mut out = Vec::with_capacity(dm.layers.len() + 1);
            out.push(dm.config);
            out.extend(dm.layers);
            Ok(out)
        }
        MEDIA_TYPE_DOCKER_MANIFEST_LIST => {
            let dml: DockerManifestList = serde_json::from_slice(&bytes)
                .map_err(|e| Error::InvalidManifest(e.to_string()))?;
            Ok(dml.manifests)
        }
        _ => Ok(Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::descriptor_from_bytes;
    use crate::memory::MemoryStore;

    #[test]
    fn image_manifest_successors_include_config_and_layers() {
        let store = MemoryStore::new();
        let config_bytes = b"{}";
        let config = descriptor_from_bytes("application/vnd.oci.image.config.v1+json", config_bytes).unwrap();
        store.push(&config, &config_bytes[..]).unwrap();

        let layer_bytes = b"foobar";
        let layer = descriptor_from_bytes("application/vnd.oci.image.layer.v1.tar", layer_bytes).unwrap();
        store.push(&layer, &layer_bytes[..]).unwrap();

        let manifest = ImageManifest {
            schema_version: 2,
            config: config.clone(),
            layers: vec![layer.clone()],
            subject: None,
        };
        let manifest_bytes = serde_json::to_vec(&manifest).unwrap();
        let manifest_desc = descriptor_from_bytes(MEDIA_TYPE_IMAGE_MANIFEST, &manifest_bytes).unwrap();
        store.push(&manifest_desc, &manifest_bytes[..]).unwrap();

        let succ = successors(&store, &manifest_desc).unwrap();
        assert_eq!(succ, vec![config, layer]);
    }

    #[test]
    fn leaf_media_type_has_no_successors() {
        let store = MemoryStore::new();
        let bytes = b"hello world";
        let desc = descriptor_from_bytes("application/vnd.oci.image.layer.v1.tar", bytes).unwrap();
        store.push(&desc, &bytes[..]).unwrap();
        assert_eq!(successors(&store, &desc).unwrap(), Vec::new());
    }
}
