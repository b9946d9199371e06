use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// `meta.json` of a finished block.
///
/// The shape follows the block-metadata convention of the metrics store
/// ecosystem: camel-cased time range and stats, a compaction section, and
/// an extension section carrying external labels (including the tenant
/// label) and the producing source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMeta {
    /// Block identifier; equals the directory name.
    pub ulid: String,
    /// First sample timestamp in the block, milliseconds, inclusive.
    #[serde(rename = "minTime")]
    pub min_time: i64,
    /// End of the block's time range, milliseconds, exclusive.
    #[serde(rename = "maxTime")]
    pub max_time: i64,
    /// Series/chunk/sample counts.
    pub stats: BlockStats,
    /// Compaction lineage; always level 1 with itself as the only source.
    pub compaction: BlockCompaction,
    /// Metadata format version.
    pub version: u32,
    /// External-label and provenance extensions.
    pub thanos: ThanosMeta,
}

/// Counts of what the block contains.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockStats {
    /// Number of samples across all chunks.
    #[serde(rename = "numSamples")]
    pub num_samples: u64,
    /// Number of series.
    #[serde(rename = "numSeries")]
    pub num_series: u64,
    /// Number of chunks.
    #[serde(rename = "numChunks")]
    pub num_chunks: u64,
}

/// Compaction lineage section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockCompaction {
    /// Compaction level; freshly built blocks are level 1.
    pub level: u32,
    /// ULIDs this block was produced from.
    pub sources: Vec<String>,
}

/// External labels and provenance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThanosMeta {
    /// External labels, including the tenant label.
    pub labels: BTreeMap<String, String>,
    /// Downsampling resolution; 0 for raw blocks.
    pub downsample: Downsample,
    /// Name of the producing component.
    pub source: String,
}

/// Downsampling section.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Downsample {
    /// Resolution in milliseconds; 0 means raw data.
    pub resolution: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_camel_cased_contract_fields() {
        let meta = BlockMeta {
            ulid: "01H0000000000000000000000".into(),
            min_time: 0,
            max_time: 31,
            stats: BlockStats {
                num_samples: 4,
                num_series: 1,
                num_chunks: 2,
            },
            compaction: BlockCompaction {
                level: 1,
                sources: vec!["01H0000000000000000000000".into()],
            },
            version: 1,
            thanos: ThanosMeta {
                labels: [("__org_id__".to_owned(), "tenant-1".to_owned())]
                    .into_iter()
                    .collect(),
                downsample: Downsample::default(),
                source: "chunks2blocks".into(),
            },
        };

        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["minTime"], 0);
        assert_eq!(json["maxTime"], 31);
        assert_eq!(json["stats"]["numSeries"], 1);
        assert_eq!(json["thanos"]["labels"]["__org_id__"], "tenant-1");

        let back: BlockMeta = serde_json::from_value(json).unwrap();
        assert_eq!(back, meta);
    }
}
