// CSDR: one active cell index per column, row-major column order.

use serde::{Deserialize, Serialize};

use crate::error::{Result, SphError};
use crate::helpers::{IntBuffer, Int3};

/// Owned CSDR: one active cell index per column of `size`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Csdr {
    size: Int3,
    cis: IntBuffer,
}

impl Csdr {
    /// All columns at cell 0.
    pub fn zeros(size: Int3) -> Self {
        Self {
            size,
            cis: vec![0; size.num_columns()],
        }
    }

    /// Wraps `cis`, checking length and cell ranges.
    pub fn from_cis(size: Int3, cis: Vec<i32>) -> Result<Self> {
        validate(0, size, &cis)?;
        Ok(Self { size, cis })
    }

    pub fn size(&self) -> Int3 {
        self.size
    }

    pub fn as_slice(&self) -> &[i32] {
        &self.cis
    }

    pub fn into_inner(self) -> IntBuffer {
        self.cis
    }

    /// Number of columns whose active cell equals `other`'s.
    pub fn matching_columns(&self, other: &[i32]) -> usize {
        matching_columns(&self.cis, other)
    }
}

impl AsRef<[i32]> for Csdr {
    fn as_ref(&self) -> &[i32] {
        &self.cis
    }
}

/// Checks that `cis` is a well-formed CSDR of `size` for IO port `io`.
pub fn validate(io: usize, size: Int3, cis: &[i32]) -> Result<()> {
    let expected = size.num_columns();
    if cis.len() != expected {
        return Err(SphError::ShapeMismatch {
            io,
            expected,
            got: cis.len(),
        });
    }

    if let Some((column, &value)) = cis
        .iter()
        .enumerate()
        .find(|(_, ci)| **ci < 0 || **ci >= size.z)
    {
        return Err(SphError::InvalidCsdr {
            io,
            column,
            value,
            column_size: size.z,
        });
    }

    Ok(())
}

/// Number of positions where `a` and `b` agree.
pub fn matching_columns(a: &[i32], b: &[i32]) -> usize {
    a.iter().zip(b.iter()).filter(|(x, y)| x == y).count()
}

/// Index of the largest value in `values`, lowest index on ties.
pub fn argmax(values: &[f32]) -> usize {
    let mut max_index = 0;
    let mut max_value = f32::NEG_INFINITY;
    for (i, &v) in values.iter().enumerate() {
        if v > max_value {
            max_value = v;
            max_index = i;
        }
    }
    max_index
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_accepts_in_range_csdr() {
        assert!(validate(0, Int3::new(2, 2, 4), &[0, 1, 2, 3]).is_ok());
    }

    #[test]
    fn validate_rejects_wrong_column_count() {
        let err = validate(2, Int3::new(2, 2, 4), &[0, 1, 2]).unwrap_err();
        assert!(matches!(
            err,
            SphError::ShapeMismatch {
                io: 2,
                expected: 4,
                got: 3
            }
        ));
    }

    #[test]
    fn validate_rejects_out_of_range_cells() {
        let err = validate(0, Int3::new(1, 3, 4), &[0, 4, 1]).unwrap_err();
        assert!(matches!(
            err,
            SphError::InvalidCsdr {
                column: 1,
                value: 4,
                ..
            }
        ));
        assert!(validate(0, Int3::new(1, 1, 4), &[-1]).is_err());
    }

    #[test]
    fn argmax_breaks_ties_toward_lowest_index() {
        assert_eq!(argmax(&[0.1, 0.5, 0.5, 0.2]), 1);
        assert_eq!(argmax(&[0.0, 0.0]), 0);
    }

    #[test]
    fn owned_csdr_counts_matches() {
        let a = Csdr::from_cis(Int3::new(1, 4, 8), vec![1, 2, 3, 4]).unwrap();
        assert_eq!(a.matching_columns(&[1, 0, 3, 0]), 2);
        assert_eq!(Csdr::zeros(Int3::new(2, 3, 5)).as_slice().len(), 6);
    }
}
