use std::cmp::Ordering;

// Store 2*k elements in a buffer, and truncate to k elements when the buffer is full.
// Using variant of median selection from quicksort.
pub struct TopKComputer {
    buffer: Box<[(f32, u32)]>,
    len: usize,
    k: usize,
    threshold: f32,
}

/// Better results first: higher score, then lower document id.
#[inline]
pub fn rank_order(a: &(f32, u32), b: &(f32, u32)) -> Ordering {
    b.0.total_cmp(&a.0).then(a.1.cmp(&b.1))
}

impl TopKComputer {
    pub fn new(k: usize) -> Self {
        let k = k.max(1);
        Self {
            buffer: vec![(0.0, 0); k * 2].into_boxed_slice(),
            len: 0,
            k,
            threshold: 0.0,
        }
    }

    pub fn push(&mut self, score: f32, id: u32) {
        if score < self.threshold {
            return;
        }
        if self.buffer.len() == self.len {
            self.threshold = self.truncate_top_k();
        }
        self.buffer[self.len] = (score, id);
        self.len += 1;
    }

    /// A lower bound of the k-th best score pushed so far, 0 until the
    /// buffer first fills up. Scores below it cannot enter the result.
    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    // Return top-k elements, best first.
    pub fn to_sorted_slice(&mut self) -> &[(f32, u32)] {
        if self.len > self.k {
            self.truncate_top_k();
        }
        self.buffer[..self.len].sort_unstable_by(rank_order);
        &self.buffer[..self.len]
    }

    // Keeps the k best and returns the score of the k-th.
    fn truncate_top_k(&mut self) -> f32 {
        let (_, kth, _) = self.buffer[..self.len].select_nth_unstable_by(self.k - 1, rank_order);
        let score = kth.0;
        self.len = self.k;
        score
    }
}
