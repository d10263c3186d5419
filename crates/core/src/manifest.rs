//! Manifest documents and their dependency sets.

use crate::hash::ContentHash;
use crate::object::{ManifestKey, ManifestVersion, ObjectKey, ObjectKind, ObjectRef};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Describes one file and the blob holding its content.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileManifest {
    pub uuid: Uuid,
    pub version: ManifestVersion,
    pub content_type: String,
    pub size: u64,
    /// Content hash of the blob.
    pub blob: ContentHash,
}

/// A file referenced by a bundle.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleEntry {
    pub uuid: Uuid,
    pub version: ManifestVersion,
    pub name: String,
}

/// Groups file manifests under names.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleManifest {
    pub uuid: Uuid,
    pub version: ManifestVersion,
    pub files: Vec<BundleEntry>,
}

/// An item listed by a collection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionItem {
    pub kind: ObjectKind,
    pub key: ObjectKey,
}

/// Lists arbitrary objects.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionManifest {
    pub uuid: Uuid,
    pub version: ManifestVersion,
    pub name: String,
    pub contents: Vec<CollectionItem>,
}

/// Any manifest document.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Manifest {
    File(FileManifest),
    Bundle(BundleManifest),
    Collection(CollectionManifest),
}

impl Manifest {
    /// Parse the document stored under `kind`/`key`.
    ///
    /// The document's own uuid and version must match its key.
    pub fn parse(kind: ObjectKind, key: &ObjectKey, bytes: &[u8]) -> crate::Result<Self> {
        let expected = ManifestKey::parse(key.as_str())?;
        let manifest = match kind {
            ObjectKind::Blob => {
                return Err(crate::Error::InvalidKind(
                    "blobs are not manifests".to_string(),
                ));
            }
            ObjectKind::FileManifest => Self::File(from_slice(bytes)?),
            ObjectKind::BundleManifest => Self::Bundle(from_slice(bytes)?),
            ObjectKind::CollectionManifest => Self::Collection(from_slice(bytes)?),
        };

        let actual = manifest.key();
        if actual != expected {
            return Err(crate::Error::ManifestIntegrity(format!(
                "document under {key} identifies itself as {actual}"
            )));
        }
        if let Self::Collection(collection) = &manifest {
            for item in &collection.contents {
                item.key.validate_for(item.kind)?;
            }
        }
        Ok(manifest)
    }

    pub fn kind(&self) -> ObjectKind {
        match self {
            Self::File(_) => ObjectKind::FileManifest,
            Self::Bundle(_) => ObjectKind::BundleManifest,
            Self::Collection(_) => ObjectKind::CollectionManifest,
        }
    }

    /// The `{uuid}.{version}` this document describes.
    pub fn key(&self) -> ManifestKey {
        match self {
            Self::File(m) => ManifestKey::new(m.uuid, m.version),
            Self::Bundle(m) => ManifestKey::new(m.uuid, m.version),
            Self::Collection(m) => ManifestKey::new(m.uuid, m.version),
        }
    }

    /// Objects that must be present before this manifest may be copied.
    pub fn dependencies(&self) -> BTreeSet<ObjectRef> {
        match self {
            Self::File(m) => BTreeSet::from([ObjectRef::new(
                ObjectKind::Blob,
                ObjectKey::blob(&m.blob),
            )]),
            Self::Bundle(m) => m
                .files
                .iter()
                .map(|f| {
                    ObjectRef::new(
                        ObjectKind::FileManifest,
                        ObjectKey::manifest(&ManifestKey::new(f.uuid, f.version)),
                    )
                })
                .collect(),
            Self::Collection(m) => m
                .contents
                .iter()
                .map(|item| ObjectRef::new(item.kind, item.key.clone()))
                .collect(),
        }
    }

    /// Serialize to JSON bytes.
    pub fn to_json(&self) -> crate::Result<Vec<u8>> {
        let result = match self {
            Self::File(m) => serde_json::to_vec(m),
            Self::Bundle(m) => serde_json::to_vec(m),
            Self::Collection(m) => serde_json::to_vec(m),
        };
        result.map_err(|e| crate::Error::Serialization(e.to_string()))
    }

    /// Reference to this manifest as a replicated object.
    pub fn object_ref(&self) -> ObjectRef {
        ObjectRef::new(self.kind(), ObjectKey::manifest(&self.key()))
    }
}

fn from_slice<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> crate::Result<T> {
    serde_json::from_slice(bytes).map_err(|e| crate::Error::Serialization(e.to_string()))
}
