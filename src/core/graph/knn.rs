use faer::MatRef;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

///////////////////////
// Heap helper items //
///////////////////////

/// Helper struct for kNN search with a heap
///
/// ### Fields
///
/// * `index` - Index position of that neighbour in the reference set
/// * `dist_sq` - Squared Euclidean distance to the query
#[derive(Debug, Clone, Copy)]
struct NeighbourItem {
    index: usize,
    dist_sq: f64,
}

impl Eq for NeighbourItem {}

impl PartialEq for NeighbourItem {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

/// Orders by distance first and index second, so the max-heap evicts the
/// farthest item and, among equally far ones, the highest index.
impl Ord for NeighbourItem {
    fn cmp(&self, other: &Self) -> Ordering {
        self.dist_sq
            .total_cmp(&other.dist_sq)
            .then(self.index.cmp(&other.index))
    }
}

impl PartialOrd for NeighbourItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Squared Euclidean distance between two points
#[inline(always)]
pub fn squared_euclidean(a: &[f64], b: &[f64]) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}

/////////////////
// Exact index //
/////////////////

/// Exact (brute force) nearest neighbour index
///
/// Keeps the reference points as row vectors and scans all of them for every
/// query. Results are deterministic: ties in distance resolve to the lower
/// reference index.
///
/// ### Fields
///
/// * `vectors` - The reference points, one row of the embedding each.
pub struct ExactKnn {
    vectors: Vec<Vec<f64>>,
}

impl ExactKnn {
    /// Creates a new index from an embedding-type matrix
    ///
    /// ### Params
    ///
    /// * `mat` - Matrix with rows = samples and columns = features.
    pub fn new(mat: MatRef<f64>) -> Self {
        let vectors: Vec<Vec<f64>> = (0..mat.nrows())
            .map(|i| mat.row(i).iter().copied().collect())
            .collect();

        Self { vectors }
    }

    /// Number of reference points
    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    /// Returns `true` if the index holds no points
    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    /// Bounded max-heap over the `k` closest reference points
    fn k_closest(&self, query: &[f64], k: usize, exclude: Option<usize>) -> BinaryHeap<NeighbourItem> {
        let mut heap = BinaryHeap::with_capacity(k + 1);
        if k == 0 {
            return heap;
        }

        for (index, vec) in self.vectors.iter().enumerate() {
            if exclude == Some(index) {
                continue;
            }
            let item = NeighbourItem {
                index,
                dist_sq: squared_euclidean(query, vec),
            };

            if heap.len() < k {
                heap.push(item);
            } else if let Some(top) = heap.peek() {
                if item < *top {
                    heap.pop();
                    heap.push(item);
                }
            }
        }

        heap
    }

    /// Query the k nearest neighbours
    ///
    /// ### Params
    ///
    /// * `query` - The query point.
    /// * `k` - Number of neighbours to return.
    /// * `exclude` - Optional reference index to skip (the query itself when
    ///   it is part of the reference set).
    ///
    /// ### Returns
    ///
    /// Tuples of (index, distance), sorted from closest to farthest.
    pub fn query(&self, query: &[f64], k: usize, exclude: Option<usize>) -> Vec<(usize, f64)> {
        self.k_closest(query, k, exclude)
            .into_sorted_vec()
            .into_iter()
            .map(|item| (item.index, item.dist_sq.sqrt()))
            .collect()
    }

    /// Distance to the k-th nearest neighbour
    ///
    /// ### Params
    ///
    /// * `query` - The query point.
    /// * `k` - Rank of the neighbour (1-based).
    /// * `exclude` - Optional reference index to skip.
    ///
    /// ### Returns
    ///
    /// `None` if fewer than `k` candidates exist (or `k == 0`), otherwise the
    /// Euclidean distance.
    pub fn kth_distance(&self, query: &[f64], k: usize, exclude: Option<usize>) -> Option<f64> {
        let heap = self.k_closest(query, k, exclude);
        if heap.len() < k || k == 0 {
            return None;
        }
        heap.peek().map(|item| item.dist_sq.sqrt())
    }

    /// Count the reference points within a radius (inclusive)
    ///
    /// ### Params
    ///
    /// * `query` - The query point.
    /// * `radius` - The Euclidean radius.
    ///
    /// ### Returns
    ///
    /// Number of points with a distance ≤ `radius`.
    pub fn count_within(&self, query: &[f64], radius: f64) -> usize {
        let radius_sq = radius * radius;
        self.vectors
            .iter()
            .filter(|vec| squared_euclidean(query, vec) <= radius_sq)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use faer::mat;

    fn line_points() -> faer::Mat<f64> {
        mat![[0.0, 0.0], [1.0, 0.0], [2.0, 0.0], [3.0, 0.0], [1.0, 0.0]]
    }

    #[test]
    fn test_query_sorted_with_tie_break() {
        let points = line_points();
        let index = ExactKnn::new(points.as_ref());

        let res = index.query(&[1.0, 0.0], 3, None);
        // indices 1 and 4 are both at distance 0; the lower index comes first
        assert_eq!(res[0], (1, 0.0));
        assert_eq!(res[1], (4, 0.0));
        // 0 and 2 are both at distance 1; index 0 wins the last slot
        assert_eq!(res[2], (0, 1.0));
    }

    #[test]
    fn test_kth_distance_excludes_self() {
        let points = line_points();
        let index = ExactKnn::new(points.as_ref());

        assert_eq!(index.kth_distance(&[0.0, 0.0], 1, Some(0)), Some(1.0));
        assert_eq!(index.kth_distance(&[0.0, 0.0], 1, None), Some(0.0));
        assert_eq!(index.kth_distance(&[3.0, 0.0], 4, Some(3)), Some(3.0));
        assert_eq!(index.kth_distance(&[3.0, 0.0], 5, Some(3)), None);
        assert_eq!(index.kth_distance(&[3.0, 0.0], 0, None), None);
    }

    #[test]
    fn test_count_within() {
        let points = line_points();
        let index = ExactKnn::new(points.as_ref());

        assert_eq!(index.count_within(&[1.0, 0.0], 1.0), 4);
        assert_eq!(index.count_within(&[10.0, 0.0], 1.0), 0);
        assert_eq!(index.len(), 5);
        assert!(!index.is_empty());
    }
}
