//! Causal attention mask for decoder-only backends (GPT-2)
//!
//! Masks are cached by `(seq_len, device_id, dtype)`. Cache hits are shallow
//! clones (Arc bump, no data copy).

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use std::collections::HashMap;
use std::sync::{LazyLock, Mutex};

type CausalMaskCache = LazyLock<Mutex<HashMap<(usize, usize, DType), Tensor>>>;

static CAUSAL_MASK_CACHE: CausalMaskCache = LazyLock::new(|| Mutex::new(HashMap::new()));

/// Assumes a single device per type.
fn device_id(device: &Device) -> usize {
    match device {
        Device::Cpu => 0,
        Device::Cuda(_) => 1,
        Device::Metal(_) => 2,
    }
}

fn lock_cache() -> std::sync::MutexGuard<'static, HashMap<(usize, usize, DType), Tensor>> {
    // A poisoned cache only ever holds complete masks
    CAUSAL_MASK_CACHE
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Create or retrieve a cached causal mask for the given sequence length
///
/// # Returns
///
/// A tensor of shape `[1, 1, seq_len, seq_len]` where:
/// - `0.0` for positions that can attend (j <= i)
/// - `-inf` for positions that cannot attend (j > i)
///
/// For seq_len=3:
/// ```text
/// [[[[0, -inf, -inf],
///    [0,    0, -inf],
///    [0,    0,    0]]]]
/// ```
pub fn create_causal_mask(seq_len: usize, device: &Device, dtype: DType) -> Result<Tensor> {
    let cache_key = (seq_len, device_id(device), dtype);

    if let Some(cached) = lock_cache().get(&cache_key) {
        return Ok(cached.clone());
    }

    let mask: Vec<f32> = (0..seq_len)
        .flat_map(|i| (0..seq_len).map(move |j| if j <= i { 0.0 } else { f32::NEG_INFINITY }))
        .collect();
    let mask_tensor = Tensor::from_vec(mask, (1, 1, seq_len, seq_len), device)?.to_dtype(dtype)?;

    lock_cache().insert(cache_key, mask_tensor.clone());

    Ok(mask_tensor)
}

/// Clear all cached masks
pub fn clear_mask_caches() {
    lock_cache().clear();
}

/// Number of cached masks
pub fn mask_cache_size() -> usize {
    lock_cache().len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_causal_mask_shape() {
        let mask = create_causal_mask(4, &Device::Cpu, DType::F32).unwrap();
        assert_eq!(mask.dims(), &[1, 1, 4, 4]);
    }

    #[test]
    #[serial]
    fn test_causal_mask_values() {
        let mask = create_causal_mask(3, &Device::Cpu, DType::F32).unwrap();
        let data: Vec<f32> = mask.flatten_all().unwrap().to_vec1().unwrap();

        assert_eq!(data[0], 0.0);
        assert!(data[1].is_infinite() && data[1] < 0.0);
        assert!(data[2].is_infinite() && data[2] < 0.0);

        assert_eq!(data[3], 0.0);
        assert_eq!(data[4], 0.0);
        assert!(data[5].is_infinite() && data[5] < 0.0);

        assert!(data[6..9].iter().all(|&v| v == 0.0));
    }

    #[test]
    #[serial]
    fn test_causal_mask_caching() {
        clear_mask_caches();
        assert_eq!(mask_cache_size(), 0);

        let _mask1 = create_causal_mask(4, &Device::Cpu, DType::F32).unwrap();
        assert_eq!(mask_cache_size(), 1);

        let _mask2 = create_causal_mask(4, &Device::Cpu, DType::F32).unwrap();
        assert_eq!(mask_cache_size(), 1);

        let _mask3 = create_causal_mask(8, &Device::Cpu, DType::F32).unwrap();
        assert_eq!(mask_cache_size(), 2);
    }
}
