//! The sort step run by the worker pool.
//!
//! Each list is owned by exactly one in-flight task, so sorting needs no
//! synchronisation.

/// How the worker pool orders a list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortStrategy {
    /// The standard library's unstable sort.
    #[default]
    Standard,
    /// O(n²) exchange sort. Deliberately slow, used as a CPU-bound
    /// benchmark workload.
    Quadratic,
}

impl SortStrategy {
    /// Sort `list` ascending, in place.
    pub fn sort(&self, list: &mut [i32]) {
        match self {
            SortStrategy::Standard => list.sort_unstable(),
            SortStrategy::Quadratic => exchange_sort(list),
        }
    }
}

fn exchange_sort(list: &mut [i32]) {
    for i in 0..list.len() {
        for j in i + 1..list.len() {
            if list[i] > list[j] {
                list.swap(i, j);
            }
        }
    }
}
