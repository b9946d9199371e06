//! Label canonicalization.
//!
//! Upstream producers usually emit sorted, unique label sets, so the
//! common path is a single verification scan. Unsorted sets and duplicate
//! names with equal values are repaired; duplicate names with differing
//! values mean the source data disagrees with itself and fail the series.

use data_types::{Label, Labels};
use snafu::Snafu;

/// The only normalization failure that escapes to callers.
#[derive(Debug, Snafu)]
pub enum NormalizeError {
    #[snafu(display(
        "duplicate label name {name:?} with different values ({first:?} vs {second:?})"
    ))]
    #[allow(missing_docs)]
    DuplicateLabelsDifferentValue {
        name: String,
        first: String,
        second: String,
    },
}

/// Outcome of one verification scan.
#[derive(Debug, PartialEq, Eq)]
enum LabelCheck {
    Clean,
    NotSorted,
    DuplicateSameValue,
    DuplicateDifferentValue {
        name: String,
        first: String,
        second: String,
    },
}

/// Scan once, tracking the previous pair. Returns the first problem found;
/// `DuplicateSameValue` is only reported if the whole scan saw no harder
/// problem first.
fn check_labels(labels: &[Label]) -> LabelCheck {
    let mut prev_name = "";
    let mut prev_value = "";
    let mut unique = true;

    for label in labels {
        if label.name.as_str() < prev_name {
            return LabelCheck::NotSorted;
        }
        if label.name == prev_name {
            if label.value != prev_value {
                return LabelCheck::DuplicateDifferentValue {
                    name: label.name.clone(),
                    first: prev_value.to_owned(),
                    second: label.value.clone(),
                };
            }
            unique = false;
        }
        prev_name = &label.name;
        prev_value = &label.value;
    }

    if unique {
        LabelCheck::Clean
    } else {
        LabelCheck::DuplicateSameValue
    }
}

/// Drop repeated `(name, value)` occurrences, keeping the first. Input must
/// already be sorted by name.
fn remove_duplicate_labels(labels: Vec<Label>) -> Vec<Label> {
    let mut out: Vec<Label> = Vec::with_capacity(labels.len());
    for label in labels {
        let duplicate = matches!(
            out.last(),
            Some(prev) if prev.name == label.name && prev.value == label.value
        );
        if !duplicate {
            out.push(label);
        }
    }
    out
}

/// Bring a label set into canonical form: name-ascending, no duplicate
/// names. Idempotent.
pub fn normalize_labels(labels: Labels) -> Result<Labels, NormalizeError> {
    let mut labels = labels.into_vec();

    let mut check = check_labels(&labels);
    if check == LabelCheck::NotSorted {
        // Stable, so equal names keep their relative value order and the
        // duplicate classification below stays meaningful.
        labels.sort_by(|a, b| a.name.cmp(&b.name));
        check = check_labels(&labels);
    }
    if check == LabelCheck::DuplicateSameValue {
        labels = remove_duplicate_labels(labels);
        check = check_labels(&labels);
    }

    match check {
        LabelCheck::Clean => Ok(Labels::new(labels)),
        LabelCheck::DuplicateDifferentValue {
            name,
            first,
            second,
        } => DuplicateLabelsDifferentValueSnafu {
            name,
            first,
            second,
        }
        .fail(),
        // Sorting resolves NotSorted and compaction resolves
        // DuplicateSameValue, each confirmed by a re-scan.
        LabelCheck::NotSorted | LabelCheck::DuplicateSameValue => unreachable!(),
    }
}
