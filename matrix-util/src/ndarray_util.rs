use crate::traits::*;
use ndarray::prelude::*;
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

impl SampleOps for Array2<f64> {
    type Mat = Self;
    type Scalar = f64;

    fn rnorm<R: Rng + ?Sized>(dd: usize, nn: usize, rng: &mut R) -> Self::Mat {
        Array2::from_shape_simple_fn((dd, nn), || StandardNormal.sample(rng))
    }
}

impl MatOps for Array2<f64> {
    type Mat = Self;
    type Scalar = f64;

    fn centre_columns_inplace(&mut self) {
        for mut x_j in self.columns_mut() {
            let (s1, s0) = x_j
                .iter()
                .filter(|x| x.is_finite())
                .fold((0_f64, 0_f64), |(s1, s0), &x| (s1 + x, s0 + 1.));
            if s0 > 0. {
                let mu = s1 / s0;
                x_j.mapv_inplace(|x| x - mu);
            }
        }
    }

    fn centre_columns(&self) -> Self::Mat {
        let mut xx = self.clone();
        xx.centre_columns_inplace();
        xx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn centre_columns_ignores_missing() {
        let mut xx = array![[1.0, f64::NAN], [3.0, 4.0], [f64::NAN, 8.0]];
        xx.centre_columns_inplace();
        approx::assert_abs_diff_eq!(xx[(0, 0)], -1.0);
        approx::assert_abs_diff_eq!(xx[(1, 0)], 1.0);
        approx::assert_abs_diff_eq!(xx[(1, 1)], -2.0);
        approx::assert_abs_diff_eq!(xx[(2, 1)], 2.0);
        assert!(xx[(2, 0)].is_nan());
    }

    #[test]
    fn seeded_sampling_is_reproducible() {
        let mut r1 = rand::rngs::StdRng::seed_from_u64(7);
        let mut r2 = rand::rngs::StdRng::seed_from_u64(7);
        let a = Array2::<f64>::rnorm(5, 3, &mut r1);
        let b = Array2::<f64>::rnorm(5, 3, &mut r2);
        assert_eq!(a, b);
    }
}
