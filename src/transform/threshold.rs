//! Two-class thresholding of an index image.

use super::IndexImage;
use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// Class label attached to sample points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum ClassLabel {
    /// Non-crop
    Negative,
    /// Crop
    Positive,
}

impl ClassLabel {
    /// Exported numeric value.
    pub fn value(self) -> u8 {
        match self {
            ClassLabel::Negative => 0,
            ClassLabel::Positive => 1,
        }
    }
}

impl From<ClassLabel> for u8 {
    fn from(label: ClassLabel) -> Self {
        label.value()
    }
}

impl TryFrom<u8> for ClassLabel {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ClassLabel::Negative),
            1 => Ok(ClassLabel::Positive),
            other => Err(format!("class label must be 0 or 1, got {}", other)),
        }
    }
}

impl std::fmt::Display for ClassLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.value())
    }
}

/// Index thresholds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    /// Pixels strictly above are positive
    pub positive_above: f32,

    /// Pixels strictly below are negative
    pub negative_below: f32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            positive_above: 0.4,
            negative_below: 0.2,
        }
    }
}

/// Disjoint class masks. Pixels between the thresholds and no-data pixels
/// are in neither.
#[derive(Debug, Clone)]
pub struct ClassMasks {
    pub positive: Array2<bool>,
    pub negative: Array2<bool>,
}

impl ClassMasks {
    pub fn mask(&self, label: ClassLabel) -> &Array2<bool> {
        match label {
            ClassLabel::Positive => &self.positive,
            ClassLabel::Negative => &self.negative,
        }
    }

    pub fn count(&self, label: ClassLabel) -> usize {
        self.mask(label).iter().filter(|&&v| v).count()
    }
}

impl Thresholds {
    pub fn apply(&self, index: &IndexImage) -> ClassMasks {
        // NaN compares false on both sides, so no-data lands in neither mask
        let positive = index.data.mapv(|v| v > self.positive_above);
        let negative = index.data.mapv(|v| v < self.negative_below);
        let masks = ClassMasks { positive, negative };

        tracing::debug!(
            "Thresholds (> {} positive, < {} negative): {} positive, {} negative pixels",
            self.positive_above,
            self.negative_below,
            masks.count(ClassLabel::Positive),
            masks.count(ClassLabel::Negative)
        );

        masks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_masks_and_buffer_zone() {
        let index = IndexImage {
            data: array![[0.8f32, 0.41, 0.4, 0.3], [0.2, 0.19, -0.5, f32::NAN]],
        };
        let masks = Thresholds::default().apply(&index);

        assert_eq!(masks.positive, array![[true, true, false, false], [false, false, false, false]]);
        assert_eq!(masks.negative, array![[false, false, false, false], [false, true, true, false]]);
    }

    #[test]
    fn test_masks_disjoint() {
        let index = IndexImage {
            data: Array2::from_shape_fn((20, 20), |(r, c)| (r as f32 - c as f32) / 20.0),
        };
        let masks = Thresholds::default().apply(&index);
        assert!(masks
            .positive
            .iter()
            .zip(masks.negative.iter())
            .all(|(p, n)| !(*p && *n)));
        assert!(masks.count(ClassLabel::Positive) > 0);
        assert!(masks.count(ClassLabel::Negative) > 0);
    }

    #[test]
    fn test_label_values() {
        assert_eq!(ClassLabel::Positive.value(), 1);
        assert_eq!(ClassLabel::Negative.to_string(), "0");
        assert_eq!(serde_json::to_string(&ClassLabel::Positive).unwrap(), "1");
        assert_eq!(serde_json::from_str::<ClassLabel>("0").unwrap(), ClassLabel::Negative);
        assert!(serde_json::from_str::<ClassLabel>("2").is_err());
    }
}
