//! Delay-pattern buffer for the 4-codebook decoder.
//!
//! The decoder emits all codebooks in parallel, but codebook `k` is only
//! causal if it lags the first codebook by `k` positions. The buffer keeps
//! the raw per-codebook columns and answers two questions: what goes into
//! the next decoder step (with pad tokens where a codebook has not started),
//! and which aligned frame can be read off the diagonal.
//!
//! ```text
//! step      0 1 2 3 4 5 ...
//! cb0       a a a a a a
//! cb1       P a a a a a
//! cb2       P P a a a a
//! cb3       P P P a a a
//! ```

/// Staggered token buffer over `N` codebooks.
#[derive(Debug)]
pub struct DelayPattern<const N: usize> {
    streams: [Vec<i64>; N],
}

impl<const N: usize> Default for DelayPattern<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> DelayPattern<N> {
    pub fn new() -> Self {
        assert!(N > 0, "at least one codebook required");
        Self {
            streams: [(); N].map(|()| Vec::new()),
        }
    }

    /// Appends one sampled column (one token per codebook).
    ///
    /// # Panics
    ///
    /// Panics unless the iterator yields exactly `N` tokens.
    pub fn push(&mut self, column: impl IntoIterator<Item = i64>) {
        let mut count = 0;
        for token in column {
            assert!(count < N, "expected exactly {N} tokens per column");
            self.streams[count].push(token);
            count += 1;
        }
        assert_eq!(count, N, "expected exactly {N} tokens per column");
    }

    /// Inputs for the next decoder step: the latest token of each codebook,
    /// with `pad` substituted for codebooks that have not started yet.
    pub fn next_inputs(&self, pad: i64) -> [i64; N] {
        let columns = self.streams[0].len() as i64;
        let mut inputs = [pad; N];
        for (k, slot) in inputs.iter_mut().enumerate() {
            if columns - k as i64 > 0 {
                *slot = *self.streams[k]
                    .last()
                    .expect("non-empty stream has a last token");
            }
        }
        inputs
    }

    /// The most recent fully-aligned frame, read off the anti-diagonal.
    /// None until `N` columns have accumulated.
    pub fn aligned_frame(&self) -> Option<[i64; N]> {
        let columns = self.streams[0].len();
        if columns < N {
            return None;
        }
        let mut frame = [0i64; N];
        for (k, slot) in frame.iter_mut().enumerate() {
            *slot = self.streams[k][columns - N + k];
        }
        Some(frame)
    }

    /// Columns pushed so far.
    pub fn len(&self) -> usize {
        self.streams[0].len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams[0].is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_empty() {
        let buffer = DelayPattern::<4>::new();
        assert!(buffer.is_empty());
        assert_eq!(buffer.len(), 0);
        assert_eq!(buffer.aligned_frame(), None);
    }

    #[test]
    fn pad_recedes_one_codebook_per_column() {
        let mut buffer = DelayPattern::<4>::new();
        assert_eq!(buffer.next_inputs(0), [0, 0, 0, 0]);
        buffer.push([1, 2, 3, 4]);
        assert_eq!(buffer.next_inputs(0), [1, 0, 0, 0]);
        buffer.push([5, 6, 7, 8]);
        assert_eq!(buffer.next_inputs(0), [5, 6, 0, 0]);
        buffer.push([9, 10, 11, 12]);
        assert_eq!(buffer.next_inputs(0), [9, 10, 11, 0]);
        buffer.push([13, 14, 15, 16]);
        assert_eq!(buffer.next_inputs(0), [13, 14, 15, 16]);
    }

    #[test]
    fn aligned_frames_appear_after_n_columns() {
        let mut buffer = DelayPattern::<4>::new();
        for column in [[1, 2, 3, 4], [5, 6, 7, 8], [9, 10, 11, 12]] {
            buffer.push(column);
            assert_eq!(buffer.aligned_frame(), None);
        }
        buffer.push([13, 14, 15, 16]);
        assert_eq!(buffer.aligned_frame(), Some([1, 6, 11, 16]));
        buffer.push([17, 18, 19, 20]);
        assert_eq!(buffer.aligned_frame(), Some([5, 10, 15, 20]));
    }

    #[test]
    fn no_pad_leaks_into_aligned_frames() {
        // push columns whose pad positions would be visible if the diagonal
        // read were off by one
        let pad = -1i64;
        let mut buffer = DelayPattern::<4>::new();
        for step in 0..8i64 {
            buffer.push([step; 4]);
        }
        for _ in 0..5 {
            let frame = buffer.aligned_frame().unwrap();
            assert!(frame.iter().all(|&t| t != pad));
        }
    }

    #[test]
    #[should_panic(expected = "expected exactly 4 tokens")]
    fn short_column_panics() {
        let mut buffer = DelayPattern::<4>::new();
        buffer.push([1, 2, 3]);
    }
}
