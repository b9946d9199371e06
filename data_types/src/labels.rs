use std::fmt;
use std::hash::Hasher;

use serde::{Deserialize, Serialize};
use twox_hash::XxHash64;

/// Separator fed to the hasher between label components, a byte that cannot
/// occur in UTF-8 label names or values.
const HASH_SEPARATOR: u8 = 0xff;

/// A single name/value pair.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Label {
    /// Label name.
    pub name: String,
    /// Label value.
    pub value: String,
}

impl Label {
    /// Create a label from anything string-like.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// An ordered label set.
///
/// The canonical form is name-ascending with no duplicate names; producing
/// the canonical form is the normalizer's job, this type only carries the
/// sequence. Comparison is lexicographic over `(name, value)` pairs, which
/// together with [`hash64`](Self::hash64) defines the total series order
/// used throughout the builder.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Labels(Vec<Label>);

impl Labels {
    /// Wrap a label sequence as-is.
    pub fn new(labels: Vec<Label>) -> Self {
        Self(labels)
    }

    /// Convenience constructor from `(name, value)` pairs.
    pub fn from_pairs(pairs: &[(&str, &str)]) -> Self {
        Self(pairs.iter().map(|(n, v)| Label::new(*n, *v)).collect())
    }

    /// Number of labels.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate the labels in order.
    pub fn iter(&self) -> std::slice::Iter<'_, Label> {
        self.0.iter()
    }

    /// Borrow the underlying slice.
    pub fn as_slice(&self) -> &[Label] {
        &self.0
    }

    /// Take the underlying vector, e.g. for normalization.
    pub fn into_vec(self) -> Vec<Label> {
        self.0
    }

    /// Stable 64-bit hash of the label set.
    ///
    /// Hashes `name 0xff value 0xff` byte runs with seed-0 xxhash64, so the
    /// value depends only on the label sequence, never on process state.
    pub fn hash64(&self) -> u64 {
        let mut hasher = XxHash64::with_seed(0);
        for label in &self.0 {
            hasher.write(label.name.as_bytes());
            hasher.write(&[HASH_SEPARATOR]);
            hasher.write(label.value.as_bytes());
            hasher.write(&[HASH_SEPARATOR]);
        }
        hasher.finish()
    }

    /// Sum of the byte lengths of all names and values.
    pub fn size_bytes(&self) -> usize {
        self.0
            .iter()
            .map(|l| l.name.len() + l.value.len())
            .sum()
    }
}

impl From<Vec<Label>> for Labels {
    fn from(labels: Vec<Label>) -> Self {
        Self(labels)
    }
}

impl fmt::Display for Labels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (ix, label) in self.0.iter().enumerate() {
            if ix > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}={:?}", label.name, label.value)?;
        }
        write!(f, "}}")
    }
}
