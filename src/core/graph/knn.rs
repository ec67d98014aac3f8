use faer::MatRef;
use rayon::prelude::*;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt::Debug;

use crate::core::data::sparse_structures::Support;
use crate::error::{Domain, FugwError, Result};

///////////
// Trait //
///////////

/// Strategy that decides which (source, target) pairs may carry mass
///
/// Implementations receive the two geometry embeddings in a shared space
/// (same number of columns) and must return a support in which every point of
/// both domains has at least one partner, or an `EmptySupport` error.
pub trait SupportRule: Debug + Send + Sync {
    /// Build the support
    ///
    /// ### Params
    ///
    /// * `source` - Source embedding with rows = points.
    /// * `target` - Target embedding with rows = points.
    ///
    /// ### Returns
    ///
    /// The `Support`.
    fn build(&self, source: MatRef<f64>, target: MatRef<f64>) -> Result<Support>;
}

//////////////////
// Helper types //
//////////////////

/// Helper struct for the kNN heap
///
/// ### Fields
///
/// * `index` - Index position of that neighbour
/// * `distance` - Squared distance to that neighbour
#[derive(Debug)]
struct NeighbourItem {
    index: usize,
    distance: f64,
}

impl Eq for NeighbourItem {}

impl PartialEq for NeighbourItem {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

/// Max-heap on distance; on ties the larger index is dropped first so the
/// lower index wins.
impl Ord for NeighbourItem {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .partial_cmp(&other.distance)
            .unwrap_or(Ordering::Equal)
            .then(self.index.cmp(&other.index))
    }
}

impl PartialOrd for NeighbourItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Squared Euclidean distance between two rows of two matrices
fn squared_distance(a: MatRef<f64>, i: usize, b: MatRef<f64>, j: usize) -> f64 {
    (0..a.ncols())
        .map(|c| {
            let d = a[(i, c)] - b[(j, c)];
            d * d
        })
        .sum()
}

//////////////
// kNN rule //
//////////////

/// k-nearest-neighbour support rule under Euclidean distance
///
/// Every source point is paired with its `k` nearest target points (ties
/// broken by the lower target index). Afterwards, every target point without
/// a partner receives its nearest source point.
///
/// ### Fields
///
/// * `k` - Number of target neighbours per source point.
/// * `max_distance` - Optional distance cap. Pairs further apart are not
///   eligible.
#[derive(Debug, Clone)]
pub struct KnnRule {
    pub k: usize,
    pub max_distance: Option<f64>,
}

impl Default for KnnRule {
    fn default() -> Self {
        Self {
            k: 10,
            max_distance: None,
        }
    }
}

impl KnnRule {
    /// Generate a new kNN rule
    ///
    /// ### Params
    ///
    /// * `k` - Number of target neighbours per source point.
    /// * `max_distance` - Optional distance cap.
    pub fn new(k: usize, max_distance: Option<f64>) -> Self {
        Self { k, max_distance }
    }

    /// Is a squared distance eligible under this rule
    fn eligible(&self, squared: f64) -> bool {
        squared.is_finite()
            && self
                .max_distance
                .map_or(true, |cap| squared <= cap * cap)
    }

    /// The k nearest eligible rows of `candidates` for row `i` of `query`
    fn nearest(&self, query: MatRef<f64>, i: usize, candidates: MatRef<f64>, k: usize) -> Vec<usize> {
        let mut heap = BinaryHeap::with_capacity(k + 1);

        for j in 0..candidates.nrows() {
            let distance = squared_distance(query, i, candidates, j);
            if !self.eligible(distance) {
                continue;
            }
            heap.push(NeighbourItem { index: j, distance });
            if heap.len() > k {
                heap.pop();
            }
        }

        heap.into_iter().map(|item| item.index).collect()
    }
}

impl SupportRule for KnnRule {
    fn build(&self, source: MatRef<f64>, target: MatRef<f64>) -> Result<Support> {
        crate::ensure_dim!("embedding rank", source.ncols(), target.ncols());

        if self.k == 0 {
            return Err(FugwError::invalid_parameter(
                "k",
                "number of neighbours must be at least 1",
            ));
        }

        let n_source = source.nrows();
        let n_target = target.nrows();
        let k = self.k.min(n_target);

        let forward: Vec<Vec<usize>> = (0..n_source)
            .into_par_iter()
            .map(|i| self.nearest(source, i, target, k))
            .collect();

        if let Some(index) = forward.iter().position(|n| n.is_empty()) {
            return Err(FugwError::EmptySupport {
                domain: Domain::Source,
                index,
            });
        }

        let mut covered = vec![false; n_target];
        let mut pairs: Vec<(usize, usize)> = Vec::with_capacity(n_source * k);
        for (i, neighbours) in forward.iter().enumerate() {
            for &j in neighbours {
                covered[j] = true;
                pairs.push((i, j));
            }
        }

        let uncovered: Vec<usize> = (0..n_target).filter(|&j| !covered[j]).collect();
        let backward: Vec<(usize, Vec<usize>)> = uncovered
            .into_par_iter()
            .map(|j| (j, self.nearest(target, j, source, 1)))
            .collect();

        for (j, neighbours) in backward {
            match neighbours.first() {
                Some(&i) => pairs.push((i, j)),
                None => {
                    return Err(FugwError::EmptySupport {
                        domain: Domain::Target,
                        index: j,
                    })
                }
            }
        }

        Support::from_pairs(n_source, n_target, pairs)
    }
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;
    use faer::mat;

    #[test]
    fn test_knn_rule_basic() {
        // points on a line
        let source = mat![[0.0], [1.0], [2.0]];
        let target = mat![[0.1], [0.9], [2.1], [5.0]];

        let support = KnnRule::new(1, None)
            .build(source.as_ref(), target.as_ref())
            .unwrap();

        assert!(support.contains(0, 0));
        assert!(support.contains(1, 1));
        assert!(support.contains(2, 2));
        // target 3 is nobody's nearest but gets its nearest source
        assert!(support.contains(2, 3));
        assert_eq!(support.nnz(), 4);
        assert!(support.check_coverage().is_ok());
    }

    #[test]
    fn test_knn_rule_ties_prefer_lower_index() {
        let source = mat![[0.0]];
        let target = mat![[1.0], [-1.0], [1.0]];

        let support = KnnRule::new(2, None)
            .build(source.as_ref(), target.as_ref())
            .unwrap();

        // forward pass keeps targets 0 and 1, target 2 is added backwards
        assert!(support.contains(0, 0));
        assert!(support.contains(0, 1));
        assert!(support.contains(0, 2));
    }

    #[test]
    fn test_knn_rule_k_larger_than_target() {
        let source = mat![[0.0], [1.0]];
        let target = mat![[0.0], [1.0]];

        let support = KnnRule::new(10, None)
            .build(source.as_ref(), target.as_ref())
            .unwrap();
        assert_eq!(support.nnz(), 4);
    }

    #[test]
    fn test_knn_rule_empty_source_point() {
        let source = mat![[0.0], [100.0]];
        let target = mat![[0.0], [0.5]];

        let res = KnnRule::new(2, Some(1.0)).build(source.as_ref(), target.as_ref());
        match res {
            Err(FugwError::EmptySupport { domain, index }) => {
                assert_eq!(domain, Domain::Source);
                assert_eq!(index, 1);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_knn_rule_empty_target_point() {
        let source = mat![[0.0], [0.1]];
        let target = mat![[0.0], [100.0]];

        let res = KnnRule::new(1, Some(1.0)).build(source.as_ref(), target.as_ref());
        match res {
            Err(FugwError::EmptySupport { domain, index }) => {
                assert_eq!(domain, Domain::Target);
                assert_eq!(index, 1);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_knn_rule_non_finite_is_ineligible() {
        let source = mat![[0.0], [f64::NAN]];
        let target = mat![[0.0], [1.0]];

        let res = KnnRule::new(1, None).build(source.as_ref(), target.as_ref());
        assert!(matches!(
            res,
            Err(FugwError::EmptySupport {
                domain: Domain::Source,
                index: 1
            })
        ));
    }

    #[test]
    fn test_knn_rule_zero_k() {
        let source = mat![[0.0]];
        let target = mat![[0.0]];
        let res = KnnRule::new(0, None).build(source.as_ref(), target.as_ref());
        assert!(matches!(res, Err(FugwError::InvalidParameter { .. })));
    }
}
