//! Scenario-level aggregation of spatialized chunks.

use super::cells::{decode_spatialized, encode_merged};
use crate::error::{PipelineError, Result};
use bytes::Bytes;
use h3o::CellIndex;
use std::collections::BTreeMap;

/// A merged scenario table.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutput {
    /// CSV table `h3_index,prediction`, sorted by cell.
    pub content: String,
    pub cell_count: usize,
}

struct Accumulator {
    prediction: f64,
    owned: bool,
}

/// Combine spatialized chunks into one table.
///
/// Every cell takes the max prediction over all chunks that touched it and is kept only
/// if at least one of those chunks owns it. Chunks are consumed in ascending id order and
/// the output is sorted by cell, so the same chunk set always yields the same bytes.
pub fn merge_spatialized(scenario_id: &str, chunks: &[(String, Bytes)]) -> Result<MergeOutput> {
    let fatal = |message: String| PipelineError::FatalAggregation {
        scenario_id: scenario_id.to_string(),
        message,
    };

    let mut ordered: Vec<&(String, Bytes)> = chunks.iter().collect();
    ordered.sort_by(|a, b| a.0.cmp(&b.0));
    if let Some(pair) = ordered.windows(2).find(|w| w[0].0 == w[1].0) {
        return Err(fatal(format!("chunk {} appears more than once", pair[0].0)));
    }

    let mut cells: BTreeMap<CellIndex, Accumulator> = BTreeMap::new();
    for (chunk_id, content) in ordered {
        let text = std::str::from_utf8(content)
            .map_err(|e| fatal(format!("chunk {} is not valid UTF-8: {}", chunk_id, e)))?;
        let rows = decode_spatialized(text).map_err(|e| fatal(format!("chunk {}: {:#}", chunk_id, e)))?;

        for row in rows {
            let acc = cells.entry(row.cell).or_insert(Accumulator {
                prediction: row.prediction,
                owned: false,
            });
            acc.prediction = acc.prediction.max(row.prediction);
            acc.owned |= row.owned;
        }
    }

    let merged: Vec<(CellIndex, f64)> = cells
        .into_iter()
        .filter(|(_, acc)| acc.owned)
        .map(|(cell, acc)| (cell, acc.prediction))
        .collect();

    Ok(MergeOutput {
        content: encode_merged(&merged),
        cell_count: merged.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::cells::{encode_spatialized, CellPrediction};
    use h3o::{LatLng, Resolution};

    fn cell(lat: f64, lng: f64) -> CellIndex {
        LatLng::new(lat, lng).unwrap().to_cell(Resolution::Thirteen)
    }

    fn chunk(id: &str, rows: &[CellPrediction]) -> (String, Bytes) {
        (id.to_string(), Bytes::from(encode_spatialized(rows)))
    }

    #[test]
    fn test_boundary_cell_takes_max_across_chunks() {
        let shared = cell(40.7, -74.0);
        let only_a = cell(40.71, -74.0);
        let a = chunk(
            "a",
            &[
                CellPrediction { cell: shared, prediction: 0.2, owned: true },
                CellPrediction { cell: only_a, prediction: 0.1, owned: true },
            ],
        );
        let b = chunk("b", &[CellPrediction { cell: shared, prediction: 0.7, owned: false }]);

        let out = merge_spatialized("s1", &[a, b]).unwrap();
        assert_eq!(out.cell_count, 2);
        assert!(out.content.contains(&format!("{},0.7\n", shared)));
        assert!(out.content.contains(&format!("{},0.1\n", only_a)));
    }

    #[test]
    fn test_unowned_cells_are_dropped() {
        let stray = cell(40.72, -74.0);
        let a = chunk("a", &[CellPrediction { cell: stray, prediction: 5.0, owned: false }]);
        let out = merge_spatialized("s1", &[a]).unwrap();
        assert_eq!(out.cell_count, 0);
        assert_eq!(out.content, "h3_index,prediction\n");
    }

    #[test]
    fn test_input_order_does_not_change_output() {
        let c1 = cell(40.7, -74.0);
        let c2 = cell(40.8, -74.1);
        let a = chunk("a", &[CellPrediction { cell: c1, prediction: 1.0, owned: true }]);
        let b = chunk("b", &[CellPrediction { cell: c2, prediction: 2.0, owned: true }]);

        let forward = merge_spatialized("s1", &[a.clone(), b.clone()]).unwrap();
        let backward = merge_spatialized("s1", &[b, a]).unwrap();
        assert_eq!(forward, backward);
    }

    #[test]
    fn test_malformed_chunk_is_fatal() {
        let bad = ("a".to_string(), Bytes::from_static(b"h3_index,prediction,owned\nzzz,1,true\n"));
        let err = merge_spatialized("s1", &[bad]).unwrap_err();
        assert!(matches!(err, PipelineError::FatalAggregation { .. }));
        assert!(!err.is_retriable());
    }

    #[test]
    fn test_duplicate_chunk_is_fatal() {
        let a = chunk("a", &[]);
        let err = merge_spatialized("s1", &[a.clone(), a]).unwrap_err();
        assert!(matches!(err, PipelineError::FatalAggregation { .. }));
    }
}
