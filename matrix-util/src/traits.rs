use rand::Rng;

/// Centre columns, ignoring non-finite (missing) entries
pub trait MatOps {
    type Mat;
    type Scalar;

    fn centre_columns_inplace(&mut self);
    fn centre_columns(&self) -> Self::Mat;
}

/// Operations to sample random matrices from an explicit random
/// number generator, so that every draw can be replayed from a seed
pub trait SampleOps {
    type Mat;
    type Scalar;

    /// Sample a matrix from a normal distribution `N(0,1)`
    fn rnorm<R: Rng + ?Sized>(dd: usize, nn: usize, rng: &mut R) -> Self::Mat;
}

/// Read and write matrices from and to files
pub trait IoOps {
    type Scalar;
    type Mat;

    /// Read a whitespace-delimited matrix. `NA`, `NaN` and `.` are
    /// parsed as missing values (`NaN`).
    fn from_tsv(tsv_file: &str, skip: Option<usize>) -> anyhow::Result<Self::Mat>;

    fn to_tsv(&self, tsv_file: &str) -> anyhow::Result<()>;
}
