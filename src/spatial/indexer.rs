use h3o::{CellIndex, LatLng, Resolution};
use std::collections::BTreeSet;

use crate::error::{ProcessingError, Result};

/// Maps coordinates to H3 cells at one fixed resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HexIndexer {
    resolution: Resolution,
}

impl HexIndexer {
    pub fn new(resolution: u8) -> Result<Self> {
        Ok(Self {
            resolution: Resolution::try_from(resolution)?,
        })
    }

    pub fn resolution(&self) -> u8 {
        u8::from(self.resolution)
    }

    pub fn cell_of(&self, latitude: f64, longitude: f64) -> Result<CellIndex> {
        crate::utils::validate_coordinates(latitude, longitude)?;
        let point = LatLng::new(latitude, longitude).map_err(|e| {
            ProcessingError::InvalidCoordinate(format!("({}, {}): {}", latitude, longitude, e))
        })?;
        Ok(point.to_cell(self.resolution))
    }

    /// All cells within `k` rings, excluding `cell` itself
    pub fn neighbors(&self, cell: CellIndex, k: u32) -> BTreeSet<CellIndex> {
        let mut disk: BTreeSet<CellIndex> = cell.grid_disk::<Vec<_>>(k).into_iter().collect();
        disk.remove(&cell);
        disk
    }

    /// Cell center as (latitude, longitude)
    pub fn center(cell: CellIndex) -> (f64, f64) {
        let center = LatLng::from(cell);
        (center.lat(), center.lng())
    }
}
