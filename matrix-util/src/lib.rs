/// gzip-aware line reading and writing
pub mod common_io;
/// reading and writing `ndarray` matrices as TSV
pub mod ndarray_io;
/// sampling and column operations on `ndarray` matrices
pub mod ndarray_util;
pub mod traits;
