//! The universal currency: a content descriptor and the media types/
//! annotation keys this crate recognizes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::digest::{Algorithm, Digest};

/// Tag annotation carried on a manifest descriptor inside `index.json`.
pub const ANNOTATION_REF_NAME: &str = "org.opencontainers.image.ref.name";
/// Filename/path hint carried on a file-pack descriptor.
pub const ANNOTATION_TITLE: &str = "org.opencontainers.image.title";
/// Set to `"true"` on a file-pack directory descriptor to request extraction on push.
pub const ANNOTATION_UNPACK: &str = "dev.occas.content.unpack";
/// Digest of the uncompressed tar stream, carried alongside the compressed blob digest.
pub const ANNOTATION_INNER_DIGEST: &str = "dev.occas.content.digest";

pub const MEDIA_TYPE_IMAGE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_TYPE_IMAGE_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const MEDIA_TYPE_ARTIFACT_MANIFEST: &str = "application/vnd.oci.artifact.manifest.v1+json";
pub const MEDIA_TYPE_IMAGE_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
pub const MEDIA_TYPE_IMAGE_LAYER: &str = "application/vnd.oci.image.layer.v1.tar";
pub const MEDIA_TYPE_IMAGE_LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
pub const MEDIA_TYPE_DOCKER_MANIFEST: &str =
    "application/vnd.docker.distribution.manifest.v2+json";
pub const MEDIA_TYPE_DOCKER_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";

/// `{mediaType, digest, size, annotations?, subject?}`.
///
/// Equality ignores `annotations`: two descriptors naming the same bytes
/// under the same media type are the same descriptor regardless of the
/// tag/title metadata riding along with one copy of it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Descriptor {
    #[serde(rename = "mediaType")]
    pub media_type: String,
    pub digest: Digest,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<Box<Descriptor>>,
}

impl PartialEq for Descriptor {
    fn eq(&self, other: &Self) -> bool {
        self.media_type == other.media_type && self.digest == other.digest && self.size == other.size
    }
}
impl Eq for Descriptor {}

impl std::hash::Hash for Descriptor {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.media_type.hash(state);
        self.digest.hash(state);
        self.size.hash(state);
    }
}

impl Descriptor {
    pub fn new(media_type: impl Into<String>, digest: Digest, size: u64) -> Self {
        Self {
            media_type: media_type.into(),
            digest,
            size,
            annotations: None,
            subject: None,
        }
    }

    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value.into());
        self
    }

    pub fn with_subject(mut self, subject: Descriptor) -> Self {
        self.subject = Some(Box::new(subject));
        self
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.as_ref()?.get(key).map(String::as_str)
    }

    pub fn title(&self) -> Option<&str> {
        self.annotation(ANNOTATION_TITLE)
    }

    pub fn tag(&self) -> Option<&str> {
        self.annotation(ANNOTATION_REF_NAME)
    }

    /// Key used by the copy engine's dedup set: identity independent of annotations.
    pub fn identity(&self) -> (String, Digest, u64) {
        (self.media_type.clone(), self.digest.clone(), self.size)
    }

    pub fn is_manifest_like(&self) -> bool {
        matches!(
            self.media_type.as_str(),
            MEDIA_TYPE_IMAGE_MANIFEST
                | MEDIA_TYPE_IMAGE_INDEX
                | MEDIA_TYPE_ARTIFACT_MANIFEST
                | MEDIA_TYPE_DOCKER_MANIFEST
                | MEDIA_TYPE_DOCKER_MANIFEST_LIST
        )
    }
}

/// Build a descriptor describing exactly `bytes`, using the canonical
/// (SHA-256) algorithm.
pub fn descriptor_from_bytes(media_type: impl Into<String>, bytes: &[u8]) -> crate::error::Result<Descriptor> {
    let digest = Digest::compute(Algorithm::Sha256, bytes)?;
    Ok(Descriptor::new(media_type, digest, bytes.len() as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_ignores_annotations() {
        let d1 = descriptor_from_bytes(MEDIA_TYPE_IMAGE_LAYER, b"hello world").unwrap();
        let d2 = d1.clone().with_annotation(ANNOTATION_TITLE, "greeting.txt");
        assert_eq!(d1, d2);
    }

    #[test]
    fn descriptor_from_hello_world() {
        let d = descriptor_from_bytes(MEDIA_TYPE_IMAGE_LAYER, b"hello world").unwrap();
        assert_eq!(d.size, 11);
        assert_eq!(
            d.digest.to_string(),
            "sha256:b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }
}
