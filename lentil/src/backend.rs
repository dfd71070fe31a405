use candle_core::{Device, Tensor};
use ndarray::prelude::*;

/// Where matrix contractions are carried out
///
/// Built once from `gpu_mode` and handed to every node that multiplies
/// expectation matrices.
#[derive(Clone, Debug, Default)]
pub enum ComputeBackend {
    #[default]
    Ndarray,
    Candle(Device),
}

impl ComputeBackend {
    pub fn from_gpu_mode(gpu_mode: bool) -> anyhow::Result<Self> {
        if gpu_mode {
            let dev = Device::cuda_if_available(0)?;
            if dev.is_cpu() {
                log::warn!("no cuda device found; candle will run on cpu");
            }
            Ok(ComputeBackend::Candle(dev))
        } else {
            Ok(ComputeBackend::Ndarray)
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ComputeBackend::Ndarray => "ndarray",
            ComputeBackend::Candle(dev) if dev.is_cpu() => "candle-cpu",
            ComputeBackend::Candle(_) => "candle-gpu",
        }
    }

    /// `a * b'`
    pub fn matmul_nt(&self, a: &Array2<f64>, b: &Array2<f64>) -> anyhow::Result<Array2<f64>> {
        match self {
            ComputeBackend::Ndarray => Ok(a.dot(&b.t())),
            ComputeBackend::Candle(dev) => {
                let ta = to_tensor(a, dev)?;
                let tb = to_tensor(b, dev)?.t()?.contiguous()?;
                from_tensor(&ta.matmul(&tb)?)
            }
        }
    }
}

fn to_tensor(x: &Array2<f64>, dev: &Device) -> anyhow::Result<Tensor> {
    let data: Vec<f64> = x.iter().copied().collect();
    Ok(Tensor::from_vec(data, x.dim(), dev)?)
}

fn from_tensor(x: &Tensor) -> anyhow::Result<Array2<f64>> {
    let (nr, nc) = x.dims2()?;
    let data = x.flatten_all()?.to_vec1::<f64>()?;
    Ok(Array2::from_shape_vec((nr, nc), data)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backends_agree_on_products() -> anyhow::Result<()> {
        let a = array![[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]];
        let b = array![[0.5, -1.0], [2.0, 0.25]];

        let cpu = ComputeBackend::Ndarray;
        let candle = ComputeBackend::Candle(Device::Cpu);

        let ab_cpu = cpu.matmul_nt(&a, &b)?;
        let ab_candle = candle.matmul_nt(&a, &b)?;
        approx::assert_abs_diff_eq!(ab_cpu, ab_candle, epsilon = 1e-12);
        approx::assert_abs_diff_eq!(ab_cpu[(2, 1)], 5.0 * 2.0 + 6.0 * 0.25);
        Ok(())
    }
}
