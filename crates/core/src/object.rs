//! Object kinds, keys and their layout on an object store.
//!
//! Every replicated object lives under a kind-specific prefix:
//! - `blobs/{sha256-hex}`
//! - `files/{uuid}.{version}`
//! - `bundles/{uuid}.{version}`
//! - `collections/{uuid}.{version}`
//!
//! Keys are write-once. A new manifest version is a new key.

use crate::hash::ContentHash;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;
use time::macros::format_description;
use uuid::Uuid;

/// The four kinds of replicated object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ObjectKind {
    /// Leaf content, addressed by content hash.
    #[serde(rename = "blob")]
    Blob,
    /// Describes one file and references its blob.
    #[serde(rename = "file")]
    FileManifest,
    /// Groups file manifests.
    #[serde(rename = "bundle")]
    BundleManifest,
    /// Lists arbitrary objects of any kind.
    #[serde(rename = "collection")]
    CollectionManifest,
}

impl ObjectKind {
    /// All kinds, leaves first.
    pub const ALL: [ObjectKind; 4] = [
        Self::Blob,
        Self::FileManifest,
        Self::BundleManifest,
        Self::CollectionManifest,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Blob => "blob",
            Self::FileManifest => "file",
            Self::BundleManifest => "bundle",
            Self::CollectionManifest => "collection",
        }
    }

    /// Key prefix on the object store (without trailing slash).
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Blob => "blobs",
            Self::FileManifest => "files",
            Self::BundleManifest => "bundles",
            Self::CollectionManifest => "collections",
        }
    }

    /// Whether objects of this kind can have dependencies.
    pub fn is_manifest(&self) -> bool {
        !matches!(self, Self::Blob)
    }

    fn from_prefix(prefix: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.prefix() == prefix)
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ObjectKind {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "blob" | "blobs" => Ok(Self::Blob),
            "file" | "files" => Ok(Self::FileManifest),
            "bundle" | "bundles" => Ok(Self::BundleManifest),
            "collection" | "collections" => Ok(Self::CollectionManifest),
            other => Err(crate::Error::InvalidKind(other.to_string())),
        }
    }
}

/// An opaque object key (the part after the kind prefix).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectKey(String);

impl ObjectKey {
    /// Wrap a raw key without kind-specific validation.
    ///
    /// Rejects empty keys and keys that would escape their prefix.
    pub fn new(key: impl Into<String>) -> crate::Result<Self> {
        let key = key.into();
        if key.is_empty() {
            return Err(crate::Error::InvalidKey("empty key".to_string()));
        }
        if key.contains('/') || key.contains("..") {
            return Err(crate::Error::InvalidKey(format!(
                "key must be a single path segment: {key}"
            )));
        }
        Ok(Self(key))
    }

    /// Key of a blob with the given content hash.
    pub fn blob(hash: &ContentHash) -> Self {
        Self(hash.to_hex())
    }

    /// Key of a manifest.
    pub fn manifest(key: &ManifestKey) -> Self {
        Self(key.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Validate that this key is well formed for `kind`.
    pub fn validate_for(&self, kind: ObjectKind) -> crate::Result<()> {
        match kind {
            ObjectKind::Blob => ContentHash::from_hex(&self.0).map(|_| ()),
            _ => ManifestKey::parse(&self.0).map(|_| ()),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A manifest version: a UTC timestamp with microsecond precision.
///
/// Rendered as `2024-01-02T030405.000000Z`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ManifestVersion(OffsetDateTime);

impl ManifestVersion {
    const FORMAT: &'static [time::format_description::FormatItem<'static>] = format_description!(
        "[year]-[month]-[day]T[hour][minute][second].[subsecond digits:6]Z"
    );

    pub fn new(at: OffsetDateTime) -> Self {
        let at = at.to_offset(time::UtcOffset::UTC);
        // Drop sub-microsecond precision so that parse(format(v)) == v.
        let micros = at.microsecond();
        Self(at.replace_microsecond(micros).unwrap_or(at))
    }

    pub fn now() -> Self {
        Self::new(OffsetDateTime::now_utc())
    }

    pub fn parse(s: &str) -> crate::Result<Self> {
        let parsed = time::PrimitiveDateTime::parse(s, Self::FORMAT)
            .map_err(|e| crate::Error::InvalidVersion(format!("{s}: {e}")))?;
        Ok(Self(parsed.assume_utc()))
    }

    pub fn timestamp(&self) -> OffsetDateTime {
        self.0
    }
}

impl fmt::Display for ManifestVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered = self.0.format(Self::FORMAT).map_err(|_| fmt::Error)?;
        f.write_str(&rendered)
    }
}

impl Serialize for ManifestVersion {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ManifestVersion {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// A manifest key: `{uuid}.{version}`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ManifestKey {
    pub uuid: Uuid,
    pub version: ManifestVersion,
}

impl ManifestKey {
    pub fn new(uuid: Uuid, version: ManifestVersion) -> Self {
        Self { uuid, version }
    }

    pub fn parse(s: &str) -> crate::Result<Self> {
        let (uuid, version) = s
            .split_once('.')
            .ok_or_else(|| crate::Error::InvalidKey(format!("expected {{uuid}}.{{version}}: {s}")))?;
        let uuid = Uuid::parse_str(uuid)
            .map_err(|e| crate::Error::InvalidKey(format!("invalid uuid in {s}: {e}")))?;
        Ok(Self {
            uuid,
            version: ManifestVersion::parse(version)?,
        })
    }
}

impl fmt::Display for ManifestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.uuid, self.version)
    }
}

/// A fully qualified reference to a replicated object.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectRef {
    pub kind: ObjectKind,
    pub key: ObjectKey,
}

impl ObjectRef {
    pub fn new(kind: ObjectKind, key: ObjectKey) -> Self {
        Self { kind, key }
    }

    /// Full key on the object store.
    pub fn storage_key(&self) -> String {
        format!("{}/{}", self.kind.prefix(), self.key)
    }

    /// Parse a full store key back into a reference.
    ///
    /// Keys outside the four replicated prefixes, or with a malformed object
    /// key, are rejected.
    pub fn from_storage_key(full: &str) -> crate::Result<Self> {
        let (prefix, key) = full
            .split_once('/')
            .ok_or_else(|| crate::Error::InvalidKey(format!("missing kind prefix: {full}")))?;
        let kind = ObjectKind::from_prefix(prefix)
            .ok_or_else(|| crate::Error::InvalidKind(format!("unknown prefix in {full}")))?;
        let key = ObjectKey::new(key)?;
        key.validate_for(kind)?;
        Ok(Self { kind, key })
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.key)
    }
}
