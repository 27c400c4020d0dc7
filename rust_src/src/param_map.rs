//! Two-way mapping between item parameter cells and the optimizer's
//! free-parameter space.
//!
//! Each item owns a padded derivative block of `pad_size` cells: the first
//! `num_param(item)` hold first derivatives and the packed lower triangle of
//! second derivatives follows. Every block cell maps to a free parameter, to
//! a Hessian entry, or to nothing.

use ndarray::Array2;

use crate::error::{Ba81Error, Result};
use crate::utils::{tri_index, tri_len};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamCell {
    pub item: usize,
    pub param: usize,
}

/// One optimizer parameter; equality constraints list several cells.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreeParameter {
    pub cells: Vec<ParamCell>,
}

impl FreeParameter {
    pub fn new(item: usize, param: usize) -> Self {
        Self {
            cells: vec![ParamCell { item, param }],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamSlot {
    Free(usize),
    /// Second derivative between two cells. Off-diagonal cell pairs are
    /// counted once for `(row, col)` and once for `(col, row)`.
    Hessian {
        row: usize,
        col: usize,
        off_diagonal: bool,
    },
}

#[derive(Debug, Clone)]
pub struct ParamMap {
    num_free: usize,
    pad_size: usize,
    num_param: Vec<usize>,
    slots: Vec<Option<ParamSlot>>,
    first_cell: Vec<ParamCell>,
}

/// Derivative block size for items with at most `max_param` parameters.
pub fn pad_size(max_param: usize) -> usize {
    max_param + tri_len(max_param)
}

impl ParamMap {
    pub fn new(free: &[FreeParameter], num_param: &[usize]) -> Result<Self> {
        let max_param = num_param.iter().copied().max().unwrap_or(0);
        let pad = pad_size(max_param);
        let mut slots: Vec<Option<ParamSlot>> = vec![None; num_param.len() * pad];
        let mut per_item: Vec<Vec<(usize, usize)>> = vec![Vec::new(); num_param.len()];
        let mut first_cell = Vec::with_capacity(free.len());

        for (fx, fp) in free.iter().enumerate() {
            for (cx, cell) in fp.cells.iter().enumerate() {
                if cell.item >= num_param.len() || cell.param >= num_param[cell.item] {
                    return Err(Ba81Error::ParamOutOfRange {
                        free: fx,
                        item: cell.item,
                        param: cell.param,
                    });
                }
                let slot = &mut slots[cell.item * pad + cell.param];
                if slot.is_some() {
                    return Err(Ba81Error::DuplicateParam {
                        item: cell.item,
                        param: cell.param,
                    });
                }
                *slot = Some(ParamSlot::Free(fx));
                per_item[cell.item].push((cell.param, fx));
                if cx == 0 {
                    first_cell.push(*cell);
                }
            }
            if fp.cells.is_empty() {
                return Err(Ba81Error::ParamOutOfRange {
                    free: fx,
                    item: usize::MAX,
                    param: usize::MAX,
                });
            }
        }

        for (item, cells) in per_item.iter().enumerate() {
            for (i, &(pa, fa)) in cells.iter().enumerate() {
                for &(pb, fb) in &cells[..=i] {
                    let offset = item * pad + num_param[item] + tri_index(pa, pb);
                    slots[offset] = Some(ParamSlot::Hessian {
                        row: fa.max(fb),
                        col: fa.min(fb),
                        off_diagonal: pa != pb,
                    });
                }
            }
        }

        Ok(Self {
            num_free: free.len(),
            pad_size: pad,
            num_param: num_param.to_vec(),
            slots,
            first_cell,
        })
    }

    pub fn num_free(&self) -> usize {
        self.num_free
    }

    pub fn pad_size(&self) -> usize {
        self.pad_size
    }

    pub fn slots(&self) -> &[Option<ParamSlot>] {
        &self.slots
    }

    #[inline]
    pub fn slot(&self, item: usize, offset: usize) -> Option<ParamSlot> {
        self.slots[item * self.pad_size + offset]
    }

    /// Which parameter cells of `item` the optimizer controls.
    pub fn free_mask(&self, item: usize) -> Vec<bool> {
        (0..self.num_param[item])
            .map(|p| matches!(self.slot(item, p), Some(ParamSlot::Free(_))))
            .collect()
    }

    /// Project the parameter matrix onto the free-parameter vector.
    pub fn free_values(&self, params: &Array2<f64>) -> Vec<f64> {
        self.first_cell
            .iter()
            .map(|cell| params[[cell.item, cell.param]])
            .collect()
    }

    /// Write a free-parameter vector into every cell it controls.
    pub fn apply(&self, values: &[f64], params: &mut Array2<f64>) -> Result<()> {
        if values.len() != self.num_free {
            return Err(Ba81Error::FreeValueLength {
                expected: self.num_free,
                found: values.len(),
            });
        }
        for item in 0..self.num_param.len() {
            for p in 0..self.num_param[item] {
                if let Some(ParamSlot::Free(fx)) = self.slot(item, p) {
                    params[[item, p]] = values[fx];
                }
            }
        }
        Ok(())
    }

    /// Convert log-likelihood derivative blocks into deviance gradient and
    /// Hessian contributions.
    pub fn map_derivatives(
        &self,
        deriv: &[f64],
        gradient: &mut [f64],
        mut hessian: Option<&mut Array2<f64>>,
    ) {
        for (slot, &d) in self.slots.iter().zip(deriv) {
            match slot {
                Some(ParamSlot::Free(fx)) => gradient[*fx] += -2.0 * d,
                Some(ParamSlot::Hessian {
                    row,
                    col,
                    off_diagonal,
                }) => {
                    if let Some(h) = hessian.as_deref_mut() {
                        if row == col && !off_diagonal {
                            h[[*row, *col]] += -2.0 * d;
                        } else {
                            h[[*row, *col]] += -2.0 * d;
                            h[[*col, *row]] += -2.0 * d;
                        }
                    }
                }
                None => {}
            }
        }
    }
}
