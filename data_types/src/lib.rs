//! Shared vocabulary types for the chunks-to-blocks conversion pipeline.
#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::clone_on_ref_ptr,
    clippy::todo,
    clippy::dbg_macro
)]

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

mod chunk;
mod labels;

pub use chunk::{Chunk, ChunkId, CodecError, Sample};
pub use labels::{Label, Labels};

/// Label name under which a block's owning tenant is recorded in the block
/// metadata. The rest of the metrics store recognizes blocks by this exact
/// name; do not change it.
pub const TENANT_ID_EXTERNAL_LABEL: &str = "__org_id__";

/// One entry of a conversion plan: a series and the chunks that
/// materialize it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanEntry {
    /// Opaque series identifier, used in log and error messages only.
    pub series_id: String,
    /// Chunks belonging to this series, in storage order.
    pub chunks: Vec<ChunkId>,
}

/// A fully fetched series: canonical labels plus its chunks in storage
/// order. This is the record batched in memory and spilled to run files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Series {
    /// Stable 64-bit hash of `labels`, precomputed because it is the
    /// primary sort key.
    pub hash: u64,
    /// Canonical (sorted, duplicate-free) label set.
    pub labels: Labels,
    /// Chunks in storage order; overlapping chunks are not merged.
    pub chunks: Vec<Chunk>,
}

impl Series {
    /// Total order used for spill files and the merge: `(hash, labels)`.
    pub fn cmp_key(&self, other: &Self) -> Ordering {
        self.hash
            .cmp(&other.hash)
            .then_with(|| self.labels.cmp(&other.labels))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn series(hash: u64, labels: Labels) -> Series {
        Series {
            hash,
            labels,
            chunks: vec![],
        }
    }

    #[test]
    fn series_order_is_hash_then_labels() {
        let a = series(1, Labels::from_pairs(&[("b", "2")]));
        let b = series(2, Labels::from_pairs(&[("a", "1")]));
        let c = series(2, Labels::from_pairs(&[("a", "2")]));

        assert_eq!(a.cmp_key(&b), Ordering::Less);
        assert_eq!(b.cmp_key(&c), Ordering::Less);
        assert_eq!(c.cmp_key(&c), Ordering::Equal);
    }

    #[test]
    fn plan_entry_json_round_trip() {
        let entry = PlanEntry {
            series_id: "s1".into(),
            chunks: vec![ChunkId::new("c1"), ChunkId::new("c2")],
        };
        let json = serde_json::to_string(&entry).unwrap();
        let back: PlanEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(entry, back);
    }
}
