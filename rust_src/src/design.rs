//! Ability-to-item assignment and the specific-factor grouping derived from it.

use ndarray::Array2;

use crate::error::{Ba81Error, Result};
use crate::item_model::ItemSpec;

/// Design matrix of one-based ability indices, one row per item and one
/// column per item dimension; NaN marks an unused dimension.
///
/// With `max_dims` grid dimensions and more abilities than that, abilities
/// from `max_dims` (one-based) upward are specific factors. They all share
/// the last grid coordinate and each one defines an item group.
#[derive(Debug, Clone)]
pub struct Design {
    matrix: Array2<f64>,
    max_dims: usize,
    max_abilities: usize,
    num_specific: usize,
    group: Vec<usize>,
}

impl Design {
    /// Item dimension `d` measures ability `d + 1`.
    pub fn identity(specs: &[ItemSpec]) -> Self {
        let max_dims = specs.iter().map(|s| s.dims()).max().unwrap_or(0);
        let matrix = Array2::from_shape_fn((specs.len(), max_dims), |(ix, dx)| {
            if dx < specs[ix].dims() {
                (dx + 1) as f64
            } else {
                f64::NAN
            }
        });
        Self {
            matrix,
            max_dims,
            max_abilities: max_dims,
            num_specific: 0,
            group: vec![0; specs.len()],
        }
    }

    pub fn new(matrix: Array2<f64>, specs: &[ItemSpec]) -> Result<Self> {
        let max_dims = specs.iter().map(|s| s.dims()).max().unwrap_or(0);
        if matrix.nrows() != specs.len() {
            return Err(Ba81Error::ShapeMismatch {
                what: "design rows (items)",
                expected: specs.len(),
                found: matrix.nrows(),
            });
        }
        if matrix.ncols() != max_dims {
            return Err(Ba81Error::ShapeMismatch {
                what: "design columns (dimensions)",
                expected: max_dims,
                found: matrix.ncols(),
            });
        }

        let mut max_abilities = max_dims;
        for ((item, dim), &value) in matrix.indexed_iter() {
            if value.is_nan() {
                continue;
            }
            if !value.is_finite() || value.fract() != 0.0 || value < 1.0 {
                return Err(Ba81Error::DesignValue { item, dim, value });
            }
            max_abilities = max_abilities.max(value as usize);
        }

        for (item, spec) in specs.iter().enumerate() {
            let assigned = matrix.row(item).iter().filter(|v| !v.is_nan()).count();
            if assigned > spec.dims() {
                return Err(Ba81Error::DesignOverflow {
                    item,
                    found: assigned,
                    dims: spec.dims(),
                });
            }
        }

        let num_specific = if max_abilities > max_dims {
            max_abilities - max_dims + 1
        } else {
            0
        };

        let mut group = vec![0usize; specs.len()];
        if num_specific > 0 {
            let first_specific = max_dims - 1;
            for (item, g) in group.iter_mut().enumerate() {
                let mut found: Option<usize> = None;
                for &value in matrix.row(item).iter().filter(|v| !v.is_nan()) {
                    let ability = value as usize - 1;
                    if ability < first_specific {
                        continue;
                    }
                    match found {
                        Some(prev) if prev != ability => {
                            return Err(Ba81Error::MultipleSpecific { item });
                        }
                        _ => found = Some(ability),
                    }
                }
                *g = found.map(|a| a - first_specific).unwrap_or(0);
            }
        }

        Ok(Self {
            matrix,
            max_dims,
            max_abilities,
            num_specific,
            group,
        })
    }

    pub fn matrix(&self) -> &Array2<f64> {
        &self.matrix
    }

    /// Number of grid dimensions (the largest item dimensionality).
    pub fn max_dims(&self) -> usize {
        self.max_dims
    }

    pub fn max_abilities(&self) -> usize {
        self.max_abilities
    }

    pub fn num_specific(&self) -> usize {
        self.num_specific
    }

    pub fn has_specific(&self) -> bool {
        self.num_specific > 0
    }

    /// Likelihood groups per grid node: one per specific factor, or a single
    /// group holding every item.
    pub fn num_groups(&self) -> usize {
        self.num_specific.max(1)
    }

    pub fn primary_dims(&self) -> usize {
        if self.has_specific() {
            self.max_dims - 1
        } else {
            self.max_dims
        }
    }

    pub fn group(&self, item: usize) -> usize {
        self.group[item]
    }

    pub fn groups(&self) -> &[usize] {
        &self.group
    }

    /// Zero-based ability measured by dimension `dim` of `item`.
    #[inline]
    pub fn ability(&self, item: usize, dim: usize) -> Option<usize> {
        let value = self.matrix[[item, dim]];
        if value.is_nan() {
            None
        } else {
            Some(value as usize - 1)
        }
    }

    /// Grid coordinate feeding dimension `dim` of `item`. Abilities past the
    /// grid are specific factors and read the shared last coordinate.
    #[inline]
    pub fn grid_slot(&self, item: usize, dim: usize) -> Option<usize> {
        self.ability(item, dim).map(|a| a.min(self.max_dims - 1))
    }

    /// Gather the ability vector seen by `item` at grid point `point`.
    /// Unassigned dimensions read zero.
    #[inline]
    pub fn item_theta(&self, item: usize, point: &[f64], theta: &mut [f64]) {
        for (dim, t) in theta.iter_mut().enumerate() {
            *t = self.grid_slot(item, dim).map(|slot| point[slot]).unwrap_or(0.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn specs(dims: &[usize]) -> Vec<ItemSpec> {
        dims.iter()
            .enumerate()
            .map(|(ix, &d)| ItemSpec::from_row(ix, array![1.0, 2.0, d as f64].view()).unwrap())
            .collect()
    }

    #[test]
    fn identity_design() {
        let design = Design::identity(&specs(&[1, 2]));
        assert_eq!(design.max_dims(), 2);
        assert_eq!(design.max_abilities(), 2);
        assert!(!design.has_specific());
        assert_eq!(design.ability(0, 0), Some(0));
        assert_eq!(design.ability(0, 1), None);
        assert_eq!(design.ability(1, 1), Some(1));
    }

    #[test]
    fn bifactor_groups_and_slot_clamp() {
        let n = f64::NAN;
        let matrix = array![[1.0, 3.0], [1.0, 4.0], [1.0, n], [1.0, 5.0]];
        let design = Design::new(matrix, &specs(&[2, 2, 2, 2])).unwrap();
        assert_eq!(design.max_dims(), 2);
        assert_eq!(design.max_abilities(), 5);
        assert_eq!(design.num_specific(), 4);
        assert_eq!(design.groups(), &[1, 2, 0, 3]);

        // every specific ability reads the shared last grid coordinate
        assert_eq!(design.ability(1, 1), Some(3));
        assert_eq!(design.grid_slot(1, 1), Some(1));
        assert_eq!(design.grid_slot(3, 1), Some(1));

        let mut theta = [0.0; 2];
        design.item_theta(2, &[0.5, -1.5], &mut theta);
        assert_eq!(theta, [0.5, 0.0]);
        design.item_theta(1, &[0.5, -1.5], &mut theta);
        assert_eq!(theta, [0.5, -1.5]);
    }

    #[test]
    fn structural_errors() {
        let s = specs(&[2, 2]);
        assert!(matches!(
            Design::new(array![[1.0, 1.5], [1.0, 2.0]], &s),
            Err(Ba81Error::DesignValue { item: 0, dim: 1, .. })
        ));
        assert!(matches!(
            Design::new(array![[1.0, 2.0]], &s),
            Err(Ba81Error::ShapeMismatch { .. })
        ));
        assert!(matches!(
            Design::new(array![[1.0, 2.0], [1.0, 0.0]], &s),
            Err(Ba81Error::DesignValue { item: 1, .. })
        ));
        assert!(matches!(
            Design::new(array![[3.0, 4.0], [1.0, 2.0]], &specs(&[2, 2])),
            Err(Ba81Error::MultipleSpecific { item: 0 })
        ));

        let narrow = specs(&[1, 2]);
        assert!(matches!(
            Design::new(array![[1.0, 2.0], [1.0, 2.0]], &narrow),
            Err(Ba81Error::DesignOverflow { item: 0, found: 2, dims: 1 })
        ));
    }
}
