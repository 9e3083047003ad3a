//! Hidden-state cache for storing every layer's output of a forward pass

use anyhow::Result;
use candle_core::Tensor;

/// All-position hidden states from a forward pass.
///
/// Follows the HuggingFace `output_hidden_states` convention: entry 0 is the
/// embedding output, entry `i` the output of transformer layer `i - 1`.
/// Each tensor has shape `(seq_len, d_model)`.
#[derive(Debug)]
pub struct HiddenStates {
    states: Vec<Tensor>,
}

impl HiddenStates {
    /// Create an empty cache with capacity for n_layers (+1 for embeddings)
    pub fn with_capacity(n_layers: usize) -> Self {
        Self {
            states: Vec::with_capacity(n_layers + 1),
        }
    }

    /// Add a layer's hidden state.
    ///
    /// Accepts `(seq_len, d_model)` or a batch of one `(1, seq_len, d_model)`.
    pub fn push(&mut self, tensor: Tensor) -> Result<()> {
        let tensor = if tensor.rank() == 3 {
            tensor.squeeze(0)?
        } else {
            tensor
        };
        anyhow::ensure!(
            tensor.rank() == 2,
            "Hidden state must be (seq_len, d_model), got {:?}",
            tensor.dims()
        );
        self.states.push(tensor);
        Ok(())
    }

    /// Get the hidden state for a layer, shape `(seq_len, d_model)`
    pub fn get_layer(&self, layer: usize) -> Option<&Tensor> {
        self.states.get(layer)
    }

    /// Number of cached hidden states (embedding layer included)
    pub fn n_layers(&self) -> usize {
        self.states.len()
    }

    /// Sequence length (from the first entry)
    pub fn seq_len(&self) -> Result<usize> {
        let first = self
            .states
            .first()
            .ok_or_else(|| anyhow::anyhow!("Cache is empty"))?;
        Ok(first.dim(0)?)
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Stack into a single `(layers, seq_len, d_model)` F32 tensor.
    ///
    /// With `include_embeddings == false` the embedding output (entry 0) is
    /// dropped.
    pub fn stacked(&self, include_embeddings: bool) -> Result<Tensor> {
        let skip = usize::from(!include_embeddings);
        let selected: Vec<Tensor> = self
            .states
            .iter()
            .skip(skip)
            .map(|t| t.to_dtype(candle_core::DType::F32))
            .collect::<candle_core::Result<_>>()?;
        anyhow::ensure!(!selected.is_empty(), "No hidden states to stack");
        Ok(Tensor::stack(&selected, 0)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, IndexOp};

    #[test]
    fn test_hidden_states_basic() {
        let device = Device::Cpu;
        let seq_len = 7;
        let d_model = 16;

        let mut cache = HiddenStates::with_capacity(2);
        assert!(cache.is_empty());

        for _ in 0..3 {
            let t = Tensor::zeros((1, seq_len, d_model), DType::F32, &device).unwrap();
            cache.push(t).unwrap();
        }

        assert_eq!(cache.n_layers(), 3);
        assert_eq!(cache.seq_len().unwrap(), seq_len);
        assert_eq!(cache.get_layer(0).unwrap().dims(), &[seq_len, d_model]);
        assert!(cache.get_layer(3).is_none());
    }

    #[test]
    fn test_push_rejects_bad_rank() {
        let mut cache = HiddenStates::with_capacity(1);
        let t = Tensor::zeros((4,), DType::F32, &Device::Cpu).unwrap();
        assert!(cache.push(t).is_err());
    }

    #[test]
    fn test_stacked_drops_embeddings() {
        let device = Device::Cpu;
        let mut cache = HiddenStates::with_capacity(2);
        for layer in 0..3 {
            let t = Tensor::full(layer as f32, (5, 4), &device).unwrap();
            cache.push(t).unwrap();
        }

        let all = cache.stacked(true).unwrap();
        assert_eq!(all.dims(), &[3, 5, 4]);

        let no_emb = cache.stacked(false).unwrap();
        assert_eq!(no_emb.dims(), &[2, 5, 4]);
        let first: f32 = no_emb.i((0, 0, 0)).unwrap().to_scalar().unwrap();
        assert_eq!(first, 1.0);
    }
}
