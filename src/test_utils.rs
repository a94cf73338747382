use anyhow::Result;
use candle_core::{utils, DType, Device, Tensor};

#[cfg(any(feature = "cuda", feature = "metal"))]
pub(crate) const OK_TYPES: [DType; 2] = [DType::F32, DType::F64];
#[cfg(not(any(feature = "cuda", feature = "metal")))]
pub(crate) const OK_TYPES: [DType; 4] = [DType::F32, DType::F64, DType::F16, DType::BF16];

#[cfg(any(feature = "cuda", feature = "metal"))]
pub(crate) const FAIL_TYPES: [DType; 5] =
    [DType::U8, DType::U32, DType::I64, DType::F16, DType::BF16];
#[cfg(not(any(feature = "cuda", feature = "metal")))]
pub(crate) const FAIL_TYPES: [DType; 3] = [DType::U8, DType::U32, DType::I64];

/// Types precise enough for brute-force comparisons.
pub(crate) const NUMERIC_TYPES: [DType; 2] = [DType::F32, DType::F64];

pub(crate) fn epsilon(dtype: DType) -> f64 {
    match dtype {
        DType::F64 => 1e-6,
        DType::F32 => 1e-4,
        DType::F16 => 1e-2,
        DType::BF16 => 1e-1,
        _ => panic!("dtype not supported"),
    }
}

pub(crate) fn assert_tensor_close(a: &Tensor, b: &Tensor, epsilon: f64) -> Result<()> {
    assert_eq!(a.dtype(), b.dtype());
    assert_eq!(a.shape(), b.shape());
    let a = a.to_dtype(DType::F64)?.flatten_all()?.to_vec1::<f64>()?;
    let b = b.to_dtype(DType::F64)?.flatten_all()?.to_vec1::<f64>()?;
    for (x, y) in a.iter().zip(b.iter()) {
        assert!((x - y).abs() <= epsilon, "{:?} != {:?} (eps {})", a, b, epsilon);
    }
    Ok(())
}

fn use_gpu(gpu: bool) -> candle_core::Result<Device> {
    if gpu {
        if utils::cuda_is_available() {
            println!("CUDA is available");
            Device::new_cuda(0)
        } else if utils::metal_is_available() {
            println!("Metal is available");
            Device::new_metal(0)
        } else {
            println!("CUDA and Metal are not available, using CPU");
            Ok(Device::Cpu)
        }
    } else {
        Ok(Device::Cpu)
    }
}

pub(crate) fn test_device() -> candle_core::Result<Device> {
    #[cfg(any(feature = "cuda", feature = "metal"))]
    let device = use_gpu(true)?;
    #[cfg(not(any(feature = "cuda", feature = "metal")))]
    let device = use_gpu(false)?;
    Ok(device)
}
