/// Weighted round-robin over a fixed set of candidates.
///
/// Holds cumulative weights; a cursor position maps to a candidate by
/// binary search, so the weighted sequence is never materialised.
#[derive(Debug, Clone)]
pub struct WeightedRing {
    cumulative: Vec<u64>,
}

impl WeightedRing {
    /// Zero weights are treated as one so every candidate stays reachable.
    pub fn new(weights: impl IntoIterator<Item = u64>) -> Self {
        let mut total = 0u64;
        let cumulative = weights
            .into_iter()
            .map(|w| {
                total = total.saturating_add(w.max(1));
                total
            })
            .collect();
        Self { cumulative }
    }

    /// Length of one full weighted cycle.
    pub fn total(&self) -> u64 {
        self.cumulative.last().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.cumulative.is_empty()
    }

    /// Index of the candidate owning cycle position `cursor % total`.
    pub fn pick(&self, cursor: u64) -> Option<usize> {
        let total = self.total();
        if total == 0 {
            return None;
        }
        let slot = cursor % total;
        Some(self.cumulative.partition_point(|&end| end <= slot))
    }
}
