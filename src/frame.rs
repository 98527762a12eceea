use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One producer tick: a whole-image embedding plus one embedding per patch.
///
/// The serde names match the JSON the producer has always emitted
/// (`clsFeatures`, `patchFeatures`, `timestamp`).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureFrame {
    #[serde(rename = "clsFeatures", alias = "global_vector")]
    pub global_vector: Vec<f32>,
    #[serde(rename = "patchFeatures", alias = "patch_grid", default)]
    pub patch_grid: Vec<Vec<f32>>,
    /// Capture time in seconds since the Unix epoch. Advisory only.
    #[serde(default)]
    pub timestamp: f64,
}

/// A patch grid whose rows do not all share one length.
#[derive(Error, Copy, Clone, Debug, PartialEq, Eq)]
#[error("patch row {row} has {found} values, expected {expected}")]
pub struct RaggedGrid {
    pub row: usize,
    pub expected: usize,
    pub found: usize,
}

impl FeatureFrame {
    /// Build a frame, rejecting a ragged patch grid.
    pub fn new(
        global_vector: Vec<f32>,
        patch_grid: Vec<Vec<f32>>,
        timestamp: f64,
    ) -> Result<Self, RaggedGrid> {
        let frame = Self {
            global_vector,
            patch_grid,
            timestamp,
        };
        frame.check_grid()?;
        Ok(frame)
    }

    /// Check that every patch row has the length of the first one.
    pub fn check_grid(&self) -> Result<(), RaggedGrid> {
        let Some(first) = self.patch_grid.first() else {
            return Ok(());
        };
        let expected = first.len();
        for (row, patch) in self.patch_grid.iter().enumerate() {
            if patch.len() != expected {
                return Err(RaggedGrid {
                    row,
                    expected,
                    found: patch.len(),
                });
            }
        }
        Ok(())
    }

    pub fn patch_count(&self) -> usize {
        self.patch_grid.len()
    }

    /// Dimensionality of each patch vector, 0 for an empty grid.
    pub fn patch_dim(&self) -> usize {
        self.patch_grid.first().map_or(0, Vec::len)
    }

    pub fn value_count(&self) -> usize {
        self.global_vector.len() + self.patch_grid.iter().map(Vec::len).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.value_count() == 0
    }

    /// All values: the global vector followed by each patch row in order.
    pub fn values(&self) -> impl Iterator<Item = f32> + Clone + '_ {
        self.global_vector
            .iter()
            .chain(self.patch_grid.iter().flatten())
            .copied()
    }
}
