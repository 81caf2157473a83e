//! Data transformation: spatialization of prediction grids and scenario merging.

mod cells;
mod merge;
mod spatialize;

pub use cells::{
    decode_spatialized, encode_merged, encode_spatialized, CellPrediction, MERGED_HEADER, SPATIALIZED_HEADER,
};
pub use merge::{merge_spatialized, MergeOutput};
pub use spatialize::{parse_predictions, spatialize_chunk, H3_RESOLUTION};
