pub mod ndarray_beta;
pub mod ndarray_gamma;
pub mod ndarray_gaussian;
pub mod traits;
