//! Parameter batching for `IN (...)` predicates over externally sized input.

/// Splits key lists into sub-batches that respect a backend's bound
/// parameter ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParameterBatcher {
    ceiling: usize,
}

impl ParameterBatcher {
    /// A ceiling of zero is treated as one so that every key still lands in a batch.
    pub const fn new(ceiling: usize) -> Self {
        Self {
            ceiling: if ceiling == 0 { 1 } else { ceiling },
        }
    }

    pub const fn ceiling(&self) -> usize {
        self.ceiling
    }

    /// Number of batches `split` will produce for `len` keys.
    pub const fn batch_count(&self, len: usize) -> usize {
        len.div_ceil(self.ceiling)
    }

    /// Ordered, non-empty sub-slices each no longer than the ceiling.
    pub fn split<'a, T>(&self, keys: &'a [T]) -> std::slice::Chunks<'a, T> {
        keys.chunks(self.ceiling)
    }

    /// Owned variant of [`split`](Self::split).
    pub fn split_owned<T: Clone>(&self, keys: &[T]) -> Vec<Vec<T>> {
        self.split(keys).map(<[T]>::to_vec).collect()
    }
}
