//! Raw response data and its deduplicated pattern view.

use ndarray::{Array2, ArrayView1, ArrayView2};

use crate::error::{Ba81Error, Result};

/// Raw responses: one row per respondent, one column per item. Categories are
/// one-based; negative values mean missing.
#[derive(Debug, Clone)]
pub struct ResponseData {
    responses: Array2<i32>,
}

impl ResponseData {
    pub fn new(responses: Array2<i32>) -> Result<Self> {
        for ((row, column), &value) in responses.indexed_iter() {
            if value == 0 {
                return Err(Ba81Error::NonCategorical {
                    row,
                    column,
                    value: 0.0,
                });
            }
        }
        Ok(Self { responses })
    }

    /// Accepts floating-point data where NaN marks a missing response.
    pub fn from_f64(data: ArrayView2<f64>) -> Result<Self> {
        let mut responses = Array2::<i32>::from_elem(data.dim(), -1);
        for ((row, column), &value) in data.indexed_iter() {
            if value.is_nan() {
                continue;
            }
            if value.fract() != 0.0 || value < 1.0 || value > i32::MAX as f64 {
                return Err(Ba81Error::NonCategorical { row, column, value });
            }
            responses[[row, column]] = value as i32;
        }
        Ok(Self { responses })
    }

    pub fn rows(&self) -> usize {
        self.responses.nrows()
    }

    pub fn items(&self) -> usize {
        self.responses.ncols()
    }

    pub fn view(&self) -> ArrayView2<'_, i32> {
        self.responses.view()
    }
}

/// Unique response patterns, sorted so identical raw rows are contiguous.
///
/// Categories are stored zero-based with `-1` for missing.
#[derive(Debug, Clone)]
pub struct ResponsePatterns {
    patterns: Array2<i32>,
    multiplicity: Vec<f64>,
    first_row: Vec<usize>,
    row_pattern: Vec<usize>,
    total: f64,
}

impl ResponsePatterns {
    pub fn from_data(data: &ResponseData) -> Result<Self> {
        let raw = data.view();
        let n_rows = raw.nrows();
        let n_items = raw.ncols();

        for (row, values) in raw.outer_iter().enumerate() {
            if n_items > 0 && values.iter().all(|&v| v < 0) {
                return Err(Ba81Error::EmptyRow { row });
            }
        }

        let mut order: Vec<usize> = (0..n_rows).collect();
        order.sort_by(|&a, &b| {
            raw.row(a)
                .iter()
                .map(|&v| v.max(-1))
                .cmp(raw.row(b).iter().map(|&v| v.max(-1)))
        });

        let mut unique: Vec<usize> = Vec::new();
        let mut multiplicity: Vec<f64> = Vec::new();
        let mut row_pattern = vec![0usize; n_rows];
        for &row in &order {
            let same = unique
                .last()
                .map(|&prev| same_row(raw.row(prev), raw.row(row)))
                .unwrap_or(false);
            if same {
                if let Some(m) = multiplicity.last_mut() {
                    *m += 1.0;
                }
            } else {
                unique.push(row);
                multiplicity.push(1.0);
            }
            row_pattern[row] = unique.len() - 1;
        }

        let mut patterns = Array2::<i32>::from_elem((unique.len(), n_items), -1);
        for (px, &row) in unique.iter().enumerate() {
            for (ix, &v) in raw.row(row).iter().enumerate() {
                if v > 0 {
                    patterns[[px, ix]] = v - 1;
                }
            }
        }

        Ok(Self {
            patterns,
            multiplicity,
            first_row: unique,
            row_pattern,
            total: n_rows as f64,
        })
    }

    pub fn len(&self) -> usize {
        self.patterns.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.nrows() == 0
    }

    pub fn items(&self) -> usize {
        self.patterns.ncols()
    }

    /// Zero-based observed category, or `None` when missing.
    #[inline]
    pub fn response(&self, pattern: usize, item: usize) -> Option<usize> {
        let v = self.patterns[[pattern, item]];
        if v < 0 {
            None
        } else {
            Some(v as usize)
        }
    }

    pub fn pattern(&self, pattern: usize) -> ArrayView1<'_, i32> {
        self.patterns.row(pattern)
    }

    pub fn multiplicity(&self) -> &[f64] {
        &self.multiplicity
    }

    /// Original row index of the first respondent with each pattern.
    pub fn first_row(&self) -> &[usize] {
        &self.first_row
    }

    /// Pattern index for every original row.
    pub fn row_pattern(&self) -> &[usize] {
        &self.row_pattern
    }

    pub fn rows(&self) -> usize {
        self.row_pattern.len()
    }

    /// Total respondent count (sum of multiplicities).
    pub fn total(&self) -> f64 {
        self.total
    }

    /// Highest zero-based category observed in `item`, if any.
    pub fn max_category(&self, item: usize) -> Option<usize> {
        self.patterns
            .column(item)
            .iter()
            .filter(|&&v| v >= 0)
            .max()
            .map(|&v| v as usize)
    }
}

fn same_row(a: ArrayView1<i32>, b: ArrayView1<i32>) -> bool {
    a.iter().zip(b.iter()).all(|(&x, &y)| x == y || (x < 0 && y < 0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn duplicates_are_counted_once() {
        let data = ResponseData::new(array![[1, 2], [2, 1], [1, 2], [-1, 1], [-9, 1]]).unwrap();
        let patterns = ResponsePatterns::from_data(&data).unwrap();
        assert_eq!(patterns.len(), 3);
        assert_eq!(patterns.total(), 5.0);
        let total: f64 = patterns.multiplicity().iter().sum();
        assert_eq!(total, 5.0);

        let rp = patterns.row_pattern();
        assert_eq!(rp[0], rp[2]);
        assert_eq!(rp[3], rp[4]);
        assert_ne!(rp[0], rp[1]);
        assert_eq!(patterns.multiplicity()[rp[0]], 2.0);
        assert_eq!(patterns.response(rp[3], 0), None);
        assert_eq!(patterns.response(rp[1], 0), Some(1));
    }

    #[test]
    fn float_data_is_validated() {
        let ok = ResponseData::from_f64(array![[1.0, f64::NAN], [2.0, 1.0]].view()).unwrap();
        assert_eq!(ok.view()[[0, 1]], -1);

        let err = ResponseData::from_f64(array![[1.5, 1.0]].view()).unwrap_err();
        assert!(matches!(err, Ba81Error::NonCategorical { row: 0, column: 0, .. }));
        assert!(ResponseData::new(array![[1, 0]]).is_err());
    }

    #[test]
    fn all_missing_rows_are_rejected() {
        let data = ResponseData::new(array![[1, 2], [-1, -1]]).unwrap();
        assert!(matches!(
            ResponsePatterns::from_data(&data),
            Err(Ba81Error::EmptyRow { row: 1 })
        ));
    }
}
