//! Aggregate statistics over every value of a single frame.

use serde::Serialize;

use crate::frame::FeatureFrame;

/// min / max / mean / population standard deviation.
///
/// All fields are zero when there are no values.
#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize)]
pub struct Stats {
    pub min: f32,
    pub max: f32,
    pub mean: f32,
    pub std: f32,
    pub count: usize,
}

impl Stats {
    /// Statistics over the global vector followed by every patch row.
    pub fn compute(frame: &FeatureFrame) -> Self {
        Self::from_values(frame.values())
    }

    /// Two passes over `values`: one for min/max/mean, one for the variance.
    ///
    /// NaN anywhere makes every field NaN. Infinities propagate through
    /// IEEE arithmetic, so `std` of a sequence holding one is NaN.
    pub fn from_values<I>(values: I) -> Self
    where
        I: Iterator<Item = f32> + Clone,
    {
        let mut count = 0usize;
        let mut sum = 0f64;
        let mut min = f32::INFINITY;
        let mut max = f32::NEG_INFINITY;
        let mut saw_nan = false;

        for v in values.clone() {
            count += 1;
            sum += v as f64;
            if v.is_nan() {
                saw_nan = true;
            } else {
                min = min.min(v);
                max = max.max(v);
            }
        }

        if count == 0 {
            return Self::default();
        }
        if saw_nan {
            return Self {
                min: f32::NAN,
                max: f32::NAN,
                mean: f32::NAN,
                std: f32::NAN,
                count,
            };
        }

        let n = count as f64;
        let mean = sum / n;
        let variance = values
            .map(|v| {
                let d = v as f64 - mean;
                d * d
            })
            .sum::<f64>()
            / n;

        Self {
            min,
            max,
            mean: mean as f32,
            std: variance.sqrt() as f32,
            count,
        }
    }
}
