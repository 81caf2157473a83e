//! CSV codec for H3 cell tables.

use anyhow::{bail, Context, Result};
use h3o::CellIndex;

/// Header of a spatialized chunk table.
pub const SPATIALIZED_HEADER: &str = "h3_index,prediction,owned";

/// Header of a merged scenario table.
pub const MERGED_HEADER: &str = "h3_index,prediction";

/// One row of a spatialized chunk.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CellPrediction {
    pub cell: CellIndex,
    pub prediction: f64,
    /// The cell's centroid lies inside the chunk that produced the row.
    pub owned: bool,
}

pub fn encode_spatialized(rows: &[CellPrediction]) -> String {
    let mut out = String::with_capacity(SPATIALIZED_HEADER.len() + 1 + rows.len() * 40);
    out.push_str(SPATIALIZED_HEADER);
    out.push('\n');
    for row in rows {
        out.push_str(&format!("{},{},{}\n", row.cell, row.prediction, row.owned));
    }
    out
}

pub fn decode_spatialized(text: &str) -> Result<Vec<CellPrediction>> {
    let mut lines = text.lines();
    match lines.next() {
        Some(header) if header.trim_end() == SPATIALIZED_HEADER => {}
        Some(header) => bail!("unexpected header '{}', expected '{}'", header, SPATIALIZED_HEADER),
        None => bail!("empty table"),
    }

    let mut rows = Vec::new();
    for (i, line) in lines.enumerate() {
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }
        let line_no = i + 2;
        let mut fields = line.split(',');
        let (Some(cell), Some(prediction), Some(owned), None) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            bail!("line {}: expected 3 fields in '{}'", line_no, line);
        };

        let cell: CellIndex = cell
            .parse()
            .with_context(|| format!("line {}: invalid H3 index '{}'", line_no, cell))?;
        let prediction: f64 = prediction
            .parse()
            .with_context(|| format!("line {}: invalid prediction '{}'", line_no, prediction))?;
        if !prediction.is_finite() {
            bail!("line {}: prediction must be finite", line_no);
        }
        let owned = parse_bool(owned).with_context(|| format!("line {}: invalid owned flag '{}'", line_no, owned))?;

        rows.push(CellPrediction { cell, prediction, owned });
    }
    Ok(rows)
}

fn parse_bool(s: &str) -> Result<bool> {
    match s {
        "true" | "True" | "1" => Ok(true),
        "false" | "False" | "0" => Ok(false),
        _ => bail!("not a boolean"),
    }
}

pub fn encode_merged(cells: &[(CellIndex, f64)]) -> String {
    let mut out = String::with_capacity(MERGED_HEADER.len() + 1 + cells.len() * 34);
    out.push_str(MERGED_HEADER);
    out.push('\n');
    for (cell, prediction) in cells {
        out.push_str(&format!("{},{}\n", cell, prediction));
    }
    out
}
