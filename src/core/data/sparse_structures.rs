use faer::MatRef;
use rustc_hash::FxHashMap;
use std::sync::Arc;

use crate::error::{Domain, FugwError, Result};

////////////////
// Structures //
////////////////

/// Structure for sparse matrices in coordinate (COO) format
///
/// Used to hand initial transport plans to the solver and to export fitted
/// plans.
///
/// ### Fields
///
/// * `rows` - Row index of every stored value.
/// * `cols` - Column index of every stored value.
/// * `values` - The stored values.
/// * `nrow` - Original number of rows.
/// * `ncol` - Original number of columns.
#[derive(Debug, Clone)]
pub struct SparseCooMatrix {
    pub rows: Vec<usize>,
    pub cols: Vec<usize>,
    pub values: Vec<f64>,
    pub nrow: usize,
    pub ncol: usize,
}

impl SparseCooMatrix {
    /// Generate a new COO matrix from pre-computed data
    ///
    /// ### Params
    ///
    /// * `rows` - Slice of the row indices.
    /// * `cols` - Slice of the column indices.
    /// * `values` - Slice of the values.
    /// * `nrow` - Original number of rows.
    /// * `ncol` - Original number of columns.
    pub fn new(rows: &[usize], cols: &[usize], values: &[f64], nrow: usize, ncol: usize) -> Self {
        crate::assert_same_len!(rows, cols, values);
        Self {
            rows: rows.to_vec(),
            cols: cols.to_vec(),
            values: values.to_vec(),
            nrow,
            ncol,
        }
    }

    /// Convert a faer dense matrix to COO format, dropping zeroes
    ///
    /// ### Params
    ///
    /// * `dense` - The original dense matrix.
    pub fn from_dense_matrix(dense: MatRef<f64>) -> Self {
        let mut rows = Vec::new();
        let mut cols = Vec::new();
        let mut values = Vec::new();

        for i in 0..dense.nrows() {
            for j in 0..dense.ncols() {
                let value = dense[(i, j)];
                if value != 0.0 {
                    rows.push(i);
                    cols.push(j);
                    values.push(value);
                }
            }
        }

        Self {
            rows,
            cols,
            values,
            nrow: dense.nrows(),
            ncol: dense.ncols(),
        }
    }

    /// Return the number of stored values
    pub fn nnz(&self) -> usize {
        self.values.len()
    }
}

/// The fixed set of (source, target) index pairs allowed to carry mass
///
/// Entries are stored in compressed row order (sorted by row, then column).
/// A column permutation (`col_order`, `col_ptr`) groups the same entries by
/// target column without copying any values.
///
/// ### Fields
///
/// * `n_source` - Number of source points (rows).
/// * `n_target` - Number of target points (columns).
/// * `row_ptr` - Row pointers into the entry arrays, length `n_source + 1`.
/// * `row_indices` - Source index of every entry.
/// * `col_indices` - Target index of every entry.
/// * `col_ptr` - Column pointers into `col_order`, length `n_target + 1`.
/// * `col_order` - Entry positions sorted by column.
#[derive(Debug, Clone, PartialEq)]
pub struct Support {
    n_source: usize,
    n_target: usize,
    row_ptr: Vec<usize>,
    row_indices: Vec<usize>,
    col_indices: Vec<usize>,
    col_ptr: Vec<usize>,
    col_order: Vec<usize>,
}

impl Support {
    /// Build a support from index pairs
    ///
    /// Pairs are sorted and deduplicated.
    ///
    /// ### Params
    ///
    /// * `n_source` - Number of source points.
    /// * `n_target` - Number of target points.
    /// * `pairs` - The `(source, target)` pairs.
    ///
    /// ### Returns
    ///
    /// The `Support`, or a `DimensionMismatch` if an index is out of range.
    pub fn from_pairs(n_source: usize, n_target: usize, mut pairs: Vec<(usize, usize)>) -> Result<Self> {
        if let Some(&(i, _)) = pairs.iter().find(|(i, _)| *i >= n_source) {
            return Err(FugwError::DimensionMismatch {
                what: "support source index",
                expected: n_source,
                found: i + 1,
            });
        }
        if let Some(&(_, j)) = pairs.iter().find(|(_, j)| *j >= n_target) {
            return Err(FugwError::DimensionMismatch {
                what: "support target index",
                expected: n_target,
                found: j + 1,
            });
        }

        pairs.sort_unstable();
        pairs.dedup();

        let nnz = pairs.len();
        let mut row_ptr = vec![0_usize; n_source + 1];
        let mut col_counts = vec![0_usize; n_target + 1];
        let mut row_indices = Vec::with_capacity(nnz);
        let mut col_indices = Vec::with_capacity(nnz);

        for &(i, j) in &pairs {
            row_ptr[i + 1] += 1;
            col_counts[j + 1] += 1;
            row_indices.push(i);
            col_indices.push(j);
        }
        for i in 0..n_source {
            row_ptr[i + 1] += row_ptr[i];
        }
        for j in 0..n_target {
            col_counts[j + 1] += col_counts[j];
        }
        let col_ptr = col_counts.clone();

        // stable counting sort keeps rows ascending within each column
        let mut next = col_counts;
        let mut col_order = vec![0_usize; nnz];
        for (entry, &j) in col_indices.iter().enumerate() {
            col_order[next[j]] = entry;
            next[j] += 1;
        }

        Ok(Self {
            n_source,
            n_target,
            row_ptr,
            row_indices,
            col_indices,
            col_ptr,
            col_order,
        })
    }

    /// Number of source points
    pub fn n_source(&self) -> usize {
        self.n_source
    }

    /// Number of target points
    pub fn n_target(&self) -> usize {
        self.n_target
    }

    /// Number of index pairs in the support
    pub fn nnz(&self) -> usize {
        self.col_indices.len()
    }

    /// Entry positions belonging to source point `i`
    pub fn row_range(&self, i: usize) -> std::ops::Range<usize> {
        self.row_ptr[i]..self.row_ptr[i + 1]
    }

    /// Entry positions belonging to target point `j`
    pub fn col_entries(&self, j: usize) -> &[usize] {
        &self.col_order[self.col_ptr[j]..self.col_ptr[j + 1]]
    }

    /// Source index of every entry
    pub fn row_indices(&self) -> &[usize] {
        &self.row_indices
    }

    /// Target index of every entry
    pub fn col_indices(&self) -> &[usize] {
        &self.col_indices
    }

    /// The `(source, target)` pair at an entry position
    pub fn pair(&self, entry: usize) -> (usize, usize) {
        (self.row_indices[entry], self.col_indices[entry])
    }

    /// Iterate over all `(source, target)` pairs in row order
    pub fn iter(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.row_indices
            .iter()
            .copied()
            .zip(self.col_indices.iter().copied())
    }

    /// Check if a pair is part of the support
    pub fn contains(&self, i: usize, j: usize) -> bool {
        i < self.n_source
            && self.col_indices[self.row_range(i)]
                .binary_search(&j)
                .is_ok()
    }

    /// Number of entries per source point
    pub fn row_degrees(&self) -> Vec<usize> {
        (0..self.n_source)
            .map(|i| self.row_ptr[i + 1] - self.row_ptr[i])
            .collect()
    }

    /// Number of entries per target point
    pub fn col_degrees(&self) -> Vec<usize> {
        (0..self.n_target)
            .map(|j| self.col_ptr[j + 1] - self.col_ptr[j])
            .collect()
    }

    /// Verify that every point of both domains has at least one partner
    ///
    /// ### Returns
    ///
    /// `EmptySupport` naming the first uncovered point.
    pub fn check_coverage(&self) -> Result<()> {
        if let Some(index) = self.row_degrees().iter().position(|&d| d == 0) {
            return Err(FugwError::EmptySupport {
                domain: Domain::Source,
                index,
            });
        }
        if let Some(index) = self.col_degrees().iter().position(|&d| d == 0) {
            return Err(FugwError::EmptySupport {
                domain: Domain::Target,
                index,
            });
        }
        Ok(())
    }

    /// Sum entry-aligned values per source point
    pub fn row_sums(&self, values: &[f64]) -> Vec<f64> {
        crate::assert_same_len!(values, self.col_indices);
        (0..self.n_source)
            .map(|i| values[self.row_range(i)].iter().sum())
            .collect()
    }

    /// Sum entry-aligned values per target point
    pub fn col_sums(&self, values: &[f64]) -> Vec<f64> {
        crate::assert_same_len!(values, self.col_indices);
        let mut sums = vec![0.0; self.n_target];
        for (&j, &v) in self.col_indices.iter().zip(values.iter()) {
            sums[j] += v;
        }
        sums
    }
}

/// Sparse non-negative transport plan living on a fixed `Support`
///
/// ### Fields
///
/// * `support` - The shared support.
/// * `values` - One value per support entry, in support entry order.
#[derive(Debug, Clone)]
pub struct SparsePlan {
    support: Arc<Support>,
    values: Vec<f64>,
}

impl SparsePlan {
    /// Generate a new plan from entry-aligned values
    pub fn new(support: Arc<Support>, values: Vec<f64>) -> Self {
        crate::assert_same_len!(values, support.col_indices);
        Self { support, values }
    }

    /// Plan proportional to `w_s ⊗ w_t` on the support with total mass 1
    ///
    /// ### Params
    ///
    /// * `support` - The shared support.
    /// * `ws` - Source weights.
    /// * `wt` - Target weights.
    pub fn product_on_support(support: Arc<Support>, ws: &[f64], wt: &[f64]) -> Self {
        let mut values: Vec<f64> = support.iter().map(|(i, j)| ws[i] * wt[j]).collect();
        let total: f64 = values.iter().sum();
        if total > 0.0 {
            values.iter_mut().for_each(|v| *v /= total);
        }
        Self { support, values }
    }

    /// Build support and seed plan from an explicit initial plan
    ///
    /// Strictly positive entries define the support. Duplicates are summed and
    /// values are renormalised to total mass 1.
    ///
    /// ### Params
    ///
    /// * `init` - The initial plan in COO format.
    /// * `n_source` - Expected number of rows.
    /// * `n_target` - Expected number of columns.
    pub fn from_init_plan(init: &SparseCooMatrix, n_source: usize, n_target: usize) -> Result<Self> {
        crate::ensure_dim!("init plan rows", n_source, init.nrow);
        crate::ensure_dim!("init plan columns", n_target, init.ncol);
        crate::ensure_dim!("init plan column indices", init.rows.len(), init.cols.len());
        crate::ensure_dim!("init plan values", init.rows.len(), init.values.len());

        if init.values.iter().any(|v| !v.is_finite() || *v < 0.0) {
            return Err(FugwError::invalid_parameter(
                "init_plan",
                "values must be finite and non-negative",
            ));
        }

        let mut merged: FxHashMap<(usize, usize), f64> = FxHashMap::default();
        for ((&i, &j), &v) in init.rows.iter().zip(init.cols.iter()).zip(init.values.iter()) {
            *merged.entry((i, j)).or_insert(0.0) += v;
        }
        merged.retain(|_, v| *v > 0.0);

        if merged.is_empty() {
            return Err(FugwError::EmptySupport {
                domain: Domain::Source,
                index: 0,
            });
        }

        let pairs: Vec<(usize, usize)> = merged.keys().copied().collect();
        let support = Arc::new(Support::from_pairs(n_source, n_target, pairs)?);

        let total: f64 = merged.values().sum();
        let values = support.iter().map(|key| merged[&key] / total).collect();

        Ok(Self { support, values })
    }

    /// The support of the plan
    pub fn support(&self) -> &Support {
        &self.support
    }

    /// Shared handle to the support
    pub fn support_arc(&self) -> Arc<Support> {
        Arc::clone(&self.support)
    }

    /// Entry-aligned values
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Total mass of the plan
    pub fn mass(&self) -> f64 {
        self.values.iter().sum()
    }

    /// Mass per source point
    pub fn row_sums(&self) -> Vec<f64> {
        self.support.row_sums(&self.values)
    }

    /// Mass per target point
    pub fn col_sums(&self) -> Vec<f64> {
        self.support.col_sums(&self.values)
    }

    /// Multiply every value by a scalar
    pub fn scale(&mut self, factor: f64) {
        self.values.iter_mut().for_each(|v| *v *= factor);
    }

    /// Value at a pair (0 outside the support)
    pub fn get(&self, i: usize, j: usize) -> f64 {
        if i >= self.support.n_source() {
            return 0.0;
        }
        let range = self.support.row_range(i);
        match self.support.col_indices()[range.clone()].binary_search(&j) {
            Ok(pos) => self.values[range.start + pos],
            Err(_) => 0.0,
        }
    }

    /// Iterate over `(source, target, value)` triplets
    pub fn iter(&self) -> impl Iterator<Item = (usize, usize, f64)> + '_ {
        self.support
            .iter()
            .zip(self.values.iter().copied())
            .map(|((i, j), v)| (i, j, v))
    }

    /// Check that all values are finite
    pub fn is_finite(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }

    /// Export the plan to COO format
    pub fn to_coo(&self) -> SparseCooMatrix {
        SparseCooMatrix {
            rows: self.support.row_indices().to_vec(),
            cols: self.support.col_indices().to_vec(),
            values: self.values.clone(),
            nrow: self.support.n_source(),
            ncol: self.support.n_target(),
        }
    }
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use faer::mat;

    fn toy_support() -> Support {
        Support::from_pairs(3, 3, vec![(2, 0), (0, 2), (0, 0), (1, 1), (0, 2), (2, 2)]).unwrap()
    }

    #[test]
    fn test_support_sorted_and_deduplicated() {
        let support = toy_support();

        assert_eq!(support.nnz(), 5);
        let pairs: Vec<_> = support.iter().collect();
        assert_eq!(pairs, vec![(0, 0), (0, 2), (1, 1), (2, 0), (2, 2)]);
        assert_eq!(support.row_degrees(), vec![2, 1, 2]);
        assert_eq!(support.col_degrees(), vec![2, 1, 2]);
    }

    #[test]
    fn test_support_column_grouping() {
        let support = toy_support();

        for j in 0..3 {
            let rows: Vec<usize> = support
                .col_entries(j)
                .iter()
                .map(|&e| support.pair(e))
                .inspect(|&(_, col)| assert_eq!(col, j))
                .map(|(i, _)| i)
                .collect();
            let mut sorted = rows.clone();
            sorted.sort();
            assert_eq!(rows, sorted);
        }
        assert_eq!(support.col_entries(1).len(), 1);
    }

    #[test]
    fn test_support_contains() {
        let support = toy_support();
        assert!(support.contains(0, 2));
        assert!(support.contains(2, 0));
        assert!(!support.contains(1, 0));
        assert!(!support.contains(5, 0));
    }

    #[test]
    fn test_support_out_of_range() {
        let res = Support::from_pairs(2, 2, vec![(0, 3)]);
        assert!(matches!(res, Err(FugwError::DimensionMismatch { .. })));
    }

    #[test]
    fn test_support_coverage() {
        let support = Support::from_pairs(2, 3, vec![(0, 0), (1, 1)]).unwrap();
        match support.check_coverage() {
            Err(FugwError::EmptySupport { domain, index }) => {
                assert_eq!(domain, Domain::Target);
                assert_eq!(index, 2);
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(toy_support().check_coverage().is_ok());
    }

    #[test]
    fn test_plan_from_init_plan() {
        let dense = mat![[0.0, 2.0, 0.0], [1.0, 0.0, 0.0]];
        let mut coo = SparseCooMatrix::from_dense_matrix(dense.as_ref());
        // duplicate entry gets merged
        coo.rows.push(1);
        coo.cols.push(0);
        coo.values.push(1.0);

        let plan = SparsePlan::from_init_plan(&coo, 2, 3).unwrap();

        assert_eq!(plan.support().nnz(), 2);
        assert_relative_eq!(plan.mass(), 1.0, epsilon = 1e-12);
        assert_relative_eq!(plan.get(0, 1), 0.5, epsilon = 1e-12);
        assert_relative_eq!(plan.get(1, 0), 0.5, epsilon = 1e-12);
        assert_eq!(plan.get(0, 0), 0.0);
    }

    #[test]
    fn test_plan_from_init_plan_errors() {
        let coo = SparseCooMatrix::new(&[0], &[0], &[-1.0], 2, 2);
        assert!(matches!(
            SparsePlan::from_init_plan(&coo, 2, 2),
            Err(FugwError::InvalidParameter { .. })
        ));

        let coo = SparseCooMatrix::new(&[0], &[0], &[0.0], 2, 2);
        assert!(matches!(
            SparsePlan::from_init_plan(&coo, 2, 2),
            Err(FugwError::EmptySupport { .. })
        ));

        let coo = SparseCooMatrix::new(&[0], &[0], &[1.0], 3, 2);
        assert!(matches!(
            SparsePlan::from_init_plan(&coo, 2, 2),
            Err(FugwError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_plan_marginals() {
        let support = Arc::new(toy_support());
        let plan = SparsePlan::new(support, vec![1.0, 2.0, 3.0, 4.0, 5.0]);

        assert_eq!(plan.row_sums(), vec![3.0, 3.0, 9.0]);
        assert_eq!(plan.col_sums(), vec![5.0, 3.0, 7.0]);
        assert_relative_eq!(plan.mass(), 15.0);

        let coo = plan.to_coo();
        assert_eq!(coo.nnz(), 5);
        assert_eq!(coo.nrow, 3);
    }

    #[test]
    fn test_product_on_support() {
        let support = Arc::new(toy_support());
        let plan = SparsePlan::product_on_support(support, &[0.5, 0.25, 0.25], &[1.0 / 3.0; 3]);

        assert_relative_eq!(plan.mass(), 1.0, epsilon = 1e-12);
        // source point 0 has twice the weight of point 2 and the same degree
        assert_relative_eq!(plan.row_sums()[0], 2.0 * plan.row_sums()[2], epsilon = 1e-12);
    }
}
