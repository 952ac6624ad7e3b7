use serde::{Deserialize, Serialize};

/// Strongly typed ID for buckets. Wraps the store's rowid.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct BucketId(pub i64);

impl BucketId {
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for BucketId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for BucketId {
    fn from(raw: i64) -> Self {
        Self(raw)
    }
}

/// Strongly typed ID for file-queue rows.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct FileId(pub i64);

impl FileId {
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for FileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for FileId {
    fn from(raw: i64) -> Self {
        Self(raw)
    }
}
