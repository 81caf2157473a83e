//! Convert a chunk's prediction grid into H3 cells.
//!
//! Grid cell centres are computed in the study-area CRS, reprojected to WGS84 and
//! indexed at H3 resolution 13. The reprojected chunk outline decides which cells
//! the chunk *owns* (centroid inside the outline); cells near the edge also receive
//! values from the neighbouring chunk, which the merge stage combines.

use super::cells::CellPrediction;
use crate::crs::{self, codes};
use crate::error::{PipelineError, Result};
use crate::model::{ChunkGeometry, StudyArea};
use geo::{Intersects, LineString, Point, Polygon};
use h3o::{CellIndex, LatLng, Resolution};
use ndarray::Array2;
use rayon::prelude::*;
use serde::Deserialize;
use std::collections::BTreeMap;

/// H3 resolution of the delivered cells (~44 m² per cell).
pub const H3_RESOLUTION: Resolution = Resolution::Thirteen;

#[derive(Deserialize)]
struct PredictionLine {
    prediction: Vec<Vec<f64>>,
}

/// Parse a raw payload into a `(row_count, col_count)` grid, north-most row first.
pub fn parse_predictions(chunk_id: &str, raw_payload: &str, geometry: &ChunkGeometry) -> Result<Array2<f64>> {
    let mut lines = raw_payload.lines().filter(|l| !l.trim().is_empty());
    let line = lines
        .next()
        .ok_or_else(|| PipelineError::validation(chunk_id, "prediction payload is empty"))?;
    if lines.next().is_some() {
        return Err(PipelineError::validation(
            chunk_id,
            "prediction payload must contain exactly one line",
        ));
    }

    let parsed: PredictionLine = serde_json::from_str(line)
        .map_err(|e| PipelineError::validation(chunk_id, format!("invalid prediction JSON: {}", e)))?;

    let rows = parsed.prediction.len();
    let cols = parsed.prediction.first().map_or(0, Vec::len);
    if (rows, cols) != (geometry.row_count, geometry.col_count) {
        return Err(PipelineError::validation(
            chunk_id,
            format!(
                "prediction shape ({}, {}) does not match chunk shape ({}, {})",
                rows, cols, geometry.row_count, geometry.col_count
            ),
        ));
    }

    let mut values = Vec::with_capacity(rows * cols);
    for (i, row) in parsed.prediction.into_iter().enumerate() {
        if row.len() != cols {
            return Err(PipelineError::validation(
                chunk_id,
                format!("prediction row {} has {} values, expected {}", i, row.len(), cols),
            ));
        }
        values.extend(row);
    }

    Array2::from_shape_vec((rows, cols), values)
        .map_err(|e| PipelineError::validation(chunk_id, format!("invalid prediction grid: {}", e)))
}

/// Spatialize one chunk: one row per H3 cell, max prediction per cell, sorted by cell index.
pub fn spatialize_chunk(area: &StudyArea, chunk_id: &str, raw_payload: &str) -> Result<Vec<CellPrediction>> {
    let geometry = area.chunk(chunk_id)?;
    let grid = parse_predictions(chunk_id, raw_payload, geometry)?;
    let (rows, cols) = grid.dim();
    let size = area.cell_size;

    // Row 0 of the grid is the southernmost row; the payload lists rows north first.
    let mut points = Vec::with_capacity(rows * cols + 4);
    let mut values = Vec::with_capacity(rows * cols);
    for r in 0..rows {
        for c in 0..cols {
            points.push((
                geometry.x_ll_corner + (c as f64 + 0.5) * size,
                geometry.y_ll_corner + (r as f64 + 0.5) * size,
            ));
            values.push(grid[[rows - 1 - r, c]]);
        }
    }

    let (x0, y0) = (geometry.x_ll_corner, geometry.y_ll_corner);
    let (x1, y1) = (x0 + cols as f64 * size, y0 + rows as f64 * size);
    points.extend([(x0, y0), (x1, y0), (x1, y1), (x0, y1)]);

    crs::transform_points(&mut points, &area.crs, codes::WGS84)
        .map_err(|e| PipelineError::validation(chunk_id, format!("{:#}", e)))?;

    let corners = points.split_off(rows * cols);
    let outline = Polygon::new(LineString::from(corners), vec![]);

    let cells: Vec<CellPrediction> = points
        .par_iter()
        .zip(values.par_iter())
        .map(|(&(lon, lat), &prediction)| {
            let cell = to_cell(chunk_id, lat, lon)?;
            let centroid = LatLng::from(cell);
            let owned = outline.intersects(&Point::new(centroid.lng(), centroid.lat()));
            Ok(CellPrediction { cell, prediction, owned })
        })
        .collect::<Result<_>>()?;

    Ok(aggregate(cells))
}

fn to_cell(chunk_id: &str, lat: f64, lon: f64) -> Result<CellIndex> {
    let coord = LatLng::new(lat, lon).map_err(|e| {
        PipelineError::validation(chunk_id, format!("point ({}, {}) is not a valid lat/lng: {}", lat, lon, e))
    })?;
    Ok(coord.to_cell(H3_RESOLUTION))
}

/// Collapse rows sharing a cell: max prediction, owned if any row is owned.
fn aggregate(rows: Vec<CellPrediction>) -> Vec<CellPrediction> {
    let mut by_cell: BTreeMap<CellIndex, CellPrediction> = BTreeMap::new();
    for row in rows {
        by_cell
            .entry(row.cell)
            .and_modify(|existing| {
                existing.prediction = existing.prediction.max(row.prediction);
                existing.owned |= row.owned;
            })
            .or_insert(row);
    }
    by_cell.into_values().collect()
}
