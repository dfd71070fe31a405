/// Named sizes of a model
///
/// Only `k` changes during training, when factors are dropped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Dims {
    /// number of samples
    pub n: usize,
    /// number of views
    pub m: usize,
    /// number of factors
    pub k: usize,
    /// number of sample groups
    pub g: usize,
    /// number of features in each view
    pub d: Vec<usize>,
}

impl Dims {
    pub fn new(n: usize, k: usize, g: usize, d: Vec<usize>) -> Self {
        Self {
            n,
            m: d.len(),
            k,
            g,
            d,
        }
    }

    pub fn total_features(&self) -> usize {
        self.d.iter().sum()
    }
}
