// Connection tables: which input feature maps feed which output maps
//
// A table is an ordered list of (input, output) pairs. The convolution
// module owns one kernel per pair, in table order. Output map `o` is the sum
// over every pair (i, o) of input map `i` correlated with that pair's kernel.
//
// A full table (every input to every output) gives a dense convolution; a
// one-to-one table gives a per-map (depthwise) filter; random tables give
// the sparse wirings of early LeNet-style networks.

use rand::seq::index::sample;
use rand::Rng;
use trellis_core::{bail, Error, Result};

/// Ordered (input, output) feature map pairs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionTable {
    pairs: Vec<(usize, usize)>,
}

impl ConnectionTable {
    pub fn from_pairs(pairs: Vec<(usize, usize)>) -> Self {
        ConnectionTable { pairs }
    }

    /// Build from a row-major `rows x cols` integer matrix. Each row must be
    /// one (input, output) pair, so `cols` must be 2.
    pub fn from_flat(rows: usize, cols: usize, data: &[usize]) -> Result<Self> {
        if cols != 2 {
            return Err(Error::InvalidTable(format!(
                "expected a [rows, 2] table, got [{}, {}]",
                rows, cols
            )));
        }
        if data.len() != rows * cols {
            return Err(Error::InvalidTable(format!(
                "[{}, {}] table needs {} entries, got {}",
                rows,
                cols,
                rows * cols,
                data.len()
            )));
        }
        let pairs = data.chunks_exact(2).map(|c| (c[0], c[1])).collect();
        Ok(ConnectionTable { pairs })
    }

    /// Every input in `0..inputs` connected to every output in `0..outputs`.
    /// Pairs are grouped by output.
    pub fn full(inputs: usize, outputs: usize) -> Self {
        Self::full_range(0..inputs, 0..outputs)
    }

    /// Full table between index ranges, grouped by output.
    pub fn full_range(inputs: std::ops::Range<usize>, outputs: std::ops::Range<usize>) -> Self {
        let mut pairs = Vec::with_capacity(inputs.len() * outputs.len());
        for o in outputs {
            for i in inputs.clone() {
                pairs.push((i, o));
            }
        }
        ConnectionTable { pairs }
    }

    /// Input `k` connected to output `k` only.
    pub fn one_to_one(n: usize) -> Self {
        ConnectionTable {
            pairs: (0..n).map(|k| (k, k)).collect(),
        }
    }

    /// Each output draws `fanin` distinct inputs at random.
    pub fn random(inputs: usize, outputs: usize, fanin: usize, rng: &mut impl Rng) -> Result<Self> {
        if fanin == 0 || fanin > inputs {
            bail!("fan-in {} must be between 1 and the {} inputs", fanin, inputs);
        }
        let mut pairs = Vec::with_capacity(outputs * fanin);
        for o in 0..outputs {
            let mut chosen = sample(rng, inputs, fanin).into_vec();
            chosen.sort_unstable();
            pairs.extend(chosen.into_iter().map(|i| (i, o)));
        }
        Ok(ConnectionTable { pairs })
    }

    /// Rows of `self` followed by rows of `other`.
    pub fn concat(&self, other: &ConnectionTable) -> ConnectionTable {
        let mut pairs = self.pairs.clone();
        pairs.extend_from_slice(&other.pairs);
        ConnectionTable { pairs }
    }

    pub fn pairs(&self) -> &[(usize, usize)] {
        &self.pairs
    }

    /// Number of pairs (= number of kernels).
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Highest input index referenced.
    pub fn max_input(&self) -> Option<usize> {
        self.pairs.iter().map(|p| p.0).max()
    }

    /// Highest output index referenced.
    pub fn max_output(&self) -> Option<usize> {
        self.pairs.iter().map(|p| p.1).max()
    }

    /// Number of pairs targeting output `o`.
    pub fn fan_in(&self, o: usize) -> usize {
        self.pairs.iter().filter(|p| p.1 == o).count()
    }

    /// Number of pairs reading input `i`.
    pub fn fan_out(&self, i: usize) -> usize {
        self.pairs.iter().filter(|p| p.0 == i).count()
    }
}
