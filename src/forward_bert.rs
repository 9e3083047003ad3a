//! BERT / RoBERTa forward pass with per-layer hidden-state capture
//!
//! Post-LayerNorm encoder (Devlin et al. 2019). RoBERTa shares the layout and
//! differs only in its position ids, which start after the padding index.
//! The attention, LayerNorm and activation helpers here are reused by the
//! DistilBERT and GPT-2 backends.

use anyhow::Result;
use candle_core::{Module, Tensor};
use candle_nn::{embedding, linear, Embedding, LayerNorm, Linear, VarBuilder};
use tracing::info;

use crate::cache::HiddenStates;
use crate::model::{load_with_prefixes, CtxrepBackend};

/// Model configuration (matches HuggingFace config.json for BERT and RoBERTa)
#[derive(Debug, Clone, serde::Deserialize)]
pub struct BertConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub intermediate_size: usize,
    #[serde(default = "default_hidden_act")]
    pub hidden_act: String,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    #[serde(default = "default_type_vocab_size")]
    pub type_vocab_size: usize,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
    #[serde(default)]
    pub pad_token_id: usize,
}

fn default_hidden_act() -> String {
    "gelu".to_string()
}

fn default_max_position_embeddings() -> usize {
    512
}

fn default_type_vocab_size() -> usize {
    2
}

fn default_layer_norm_eps() -> f64 {
    1e-12
}

/// Which position-id scheme the checkpoint was trained with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BertFlavor {
    Bert,
    Roberta,
}

impl BertFlavor {
    /// First position id used for real tokens
    fn position_offset(&self, config: &BertConfig) -> usize {
        match self {
            BertFlavor::Bert => 0,
            BertFlavor::Roberta => config.pad_token_id + 1,
        }
    }
}

/// Apply a HuggingFace `hidden_act` by name
pub(crate) fn activation(name: &str, x: &Tensor) -> Result<Tensor> {
    let out = match name {
        "gelu" => x.gelu_erf()?,
        "gelu_new" | "gelu_pytorch_tanh" | "gelu_fast" => x.gelu()?,
        "relu" => x.relu()?,
        "silu" | "swish" => candle_nn::ops::silu(x)?,
        other => anyhow::bail!("Unsupported activation: {other}"),
    };
    Ok(out)
}

/// LayerNorm accepting both `weight`/`bias` and legacy `gamma`/`beta` names
pub(crate) fn layer_norm(size: usize, eps: f64, vb: VarBuilder) -> Result<LayerNorm> {
    match candle_nn::layer_norm(size, eps, vb.clone()) {
        Ok(ln) => Ok(ln),
        Err(_) => {
            let weight = vb.get(size, "gamma")?;
            let bias = vb.get(size, "beta")?;
            Ok(LayerNorm::new(weight, bias, eps))
        }
    }
}

/// Scaled dot-product attention over already-projected Q, K, V.
///
/// Inputs are `(batch, seq_len, num_heads * head_dim)`; the output has the same
/// shape with heads merged back, before the output projection.
pub(crate) fn multi_head_attention(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    num_heads: usize,
    mask: Option<&Tensor>,
) -> Result<Tensor> {
    let (b, seq_len, hidden) = q.dims3()?;
    let head_dim = hidden / num_heads;

    let split = |t: &Tensor| -> Result<Tensor> {
        Ok(t.reshape((b, seq_len, num_heads, head_dim))?
            .transpose(1, 2)?
            .contiguous()?)
    };
    let q = split(q)?;
    let k = split(k)?;
    let v = split(v)?;

    let scale = 1.0 / (head_dim as f64).sqrt();
    let attn_weights = (q.matmul(&k.t()?.contiguous()?)? * scale)?;
    let attn_weights = match mask {
        Some(mask) => attn_weights.broadcast_add(mask)?,
        None => attn_weights,
    };
    let attn_weights = candle_nn::ops::softmax_last_dim(&attn_weights)?;
    let attn_output = attn_weights.matmul(&v)?;

    Ok(attn_output.transpose(1, 2)?.reshape((b, seq_len, ()))?)
}

/// Word + position + token-type embeddings, followed by LayerNorm
struct BertEmbeddings {
    word_embeddings: Embedding,
    position_embeddings: Embedding,
    token_type_embeddings: Embedding,
    layer_norm: LayerNorm,
    position_offset: usize,
}

impl BertEmbeddings {
    fn load(vb: VarBuilder, config: &BertConfig, position_offset: usize) -> Result<Self> {
        Ok(Self {
            word_embeddings: embedding(
                config.vocab_size,
                config.hidden_size,
                vb.pp("word_embeddings"),
            )?,
            position_embeddings: embedding(
                config.max_position_embeddings,
                config.hidden_size,
                vb.pp("position_embeddings"),
            )?,
            token_type_embeddings: embedding(
                config.type_vocab_size,
                config.hidden_size,
                vb.pp("token_type_embeddings"),
            )?,
            layer_norm: layer_norm(config.hidden_size, config.layer_norm_eps, vb.pp("LayerNorm"))?,
            position_offset,
        })
    }

    fn forward(&self, input_ids: &Tensor) -> Result<Tensor> {
        let seq_len = input_ids.dim(1)?;
        let start = self.position_offset as u32;
        let position_ids =
            Tensor::arange(start, start + seq_len as u32, input_ids.device())?.unsqueeze(0)?;
        // Single-segment input: every token type is 0
        let token_type_ids = input_ids.zeros_like()?;

        let embeddings = self.word_embeddings.forward(input_ids)?;
        let embeddings = embeddings.broadcast_add(&self.position_embeddings.forward(&position_ids)?)?;
        let embeddings = (embeddings + self.token_type_embeddings.forward(&token_type_ids)?)?;
        Ok(self.layer_norm.forward(&embeddings)?)
    }
}

/// One encoder layer: self-attention + feed-forward, each with residual + LayerNorm
struct BertLayer {
    query: Linear,
    key: Linear,
    value: Linear,
    attention_output: Linear,
    attention_norm: LayerNorm,
    intermediate: Linear,
    output: Linear,
    output_norm: LayerNorm,
    num_heads: usize,
    hidden_act: String,
}

impl BertLayer {
    fn load(vb: VarBuilder, config: &BertConfig) -> Result<Self> {
        let h = config.hidden_size;
        let attn_vb = vb.pp("attention");
        let self_vb = attn_vb.pp("self");

        Ok(Self {
            query: linear(h, h, self_vb.pp("query"))?,
            key: linear(h, h, self_vb.pp("key"))?,
            value: linear(h, h, self_vb.pp("value"))?,
            attention_output: linear(h, h, attn_vb.pp("output").pp("dense"))?,
            attention_norm: layer_norm(
                h,
                config.layer_norm_eps,
                attn_vb.pp("output").pp("LayerNorm"),
            )?,
            intermediate: linear(h, config.intermediate_size, vb.pp("intermediate").pp("dense"))?,
            output: linear(config.intermediate_size, h, vb.pp("output").pp("dense"))?,
            output_norm: layer_norm(h, config.layer_norm_eps, vb.pp("output").pp("LayerNorm"))?,
            num_heads: config.num_attention_heads,
            hidden_act: config.hidden_act.clone(),
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let attn = multi_head_attention(
            &self.query.forward(x)?,
            &self.key.forward(x)?,
            &self.value.forward(x)?,
            self.num_heads,
            None,
        )?;
        let attn = self.attention_output.forward(&attn)?;
        let x = self.attention_norm.forward(&(x + attn)?)?;

        let h = activation(&self.hidden_act, &self.intermediate.forward(&x)?)?;
        let h = self.output.forward(&h)?;
        Ok(self.output_norm.forward(&(x + h)?)?)
    }
}

/// BERT-family encoder with hidden-state capture after every layer
pub struct CtxrepBert {
    embeddings: BertEmbeddings,
    layers: Vec<BertLayer>,
    n_layers: usize,
    hidden_size: usize,
    max_positions: usize,
}

impl CtxrepBert {
    /// Load from a VarBuilder, trying each checkpoint prefix in turn
    pub fn load(
        config: &BertConfig,
        flavor: BertFlavor,
        vb: VarBuilder,
        prefixes: &[&str],
    ) -> Result<Self> {
        anyhow::ensure!(
            config.hidden_size % config.num_attention_heads == 0,
            "hidden_size {} not divisible by num_attention_heads {}",
            config.hidden_size,
            config.num_attention_heads
        );
        info!(
            "Model config: {} layers, {} hidden, {} vocab ({:?})",
            config.num_hidden_layers, config.hidden_size, config.vocab_size, flavor
        );

        let position_offset = flavor.position_offset(config);
        let (embeddings, layers) = load_with_prefixes(&vb, prefixes, |vb| {
            let embeddings = BertEmbeddings::load(vb.pp("embeddings"), config, position_offset)?;
            let mut layers = Vec::with_capacity(config.num_hidden_layers);
            for i in 0..config.num_hidden_layers {
                layers.push(BertLayer::load(vb.pp(format!("encoder.layer.{i}")), config)?);
            }
            Ok((embeddings, layers))
        })?;

        Ok(Self {
            embeddings,
            layers,
            n_layers: config.num_hidden_layers,
            hidden_size: config.hidden_size,
            max_positions: config.max_position_embeddings.saturating_sub(position_offset),
        })
    }
}

impl CtxrepBackend for CtxrepBert {
    fn n_layers(&self) -> usize {
        self.n_layers
    }

    fn d_model(&self) -> usize {
        self.hidden_size
    }

    fn max_positions(&self) -> usize {
        self.max_positions
    }

    fn forward_hidden_states(&self, input_ids: &Tensor) -> Result<HiddenStates> {
        let mut cache = HiddenStates::with_capacity(self.n_layers);

        let mut hidden = self.embeddings.forward(input_ids)?;
        cache.push(hidden.clone())?;

        for layer in &self.layers {
            hidden = layer.forward(&hidden)?;
            cache.push(hidden.clone())?;
        }

        Ok(cache)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;
    use std::collections::HashMap;

    fn tiny_config() -> BertConfig {
        serde_json::from_str(
            r#"{
                "vocab_size": 20,
                "hidden_size": 8,
                "num_hidden_layers": 2,
                "num_attention_heads": 2,
                "intermediate_size": 16,
                "max_position_embeddings": 32
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_config_defaults() {
        let config = tiny_config();
        assert_eq!(config.hidden_act, "gelu");
        assert_eq!(config.type_vocab_size, 2);
        assert_eq!(config.pad_token_id, 0);
        assert!((config.layer_norm_eps - 1e-12).abs() < f64::EPSILON);
    }

    #[test]
    fn test_forward_captures_every_layer() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = CtxrepBert::load(&tiny_config(), BertFlavor::Bert, vb, &[""]).unwrap();

        let ids = Tensor::new(&[2u32, 5, 6, 7, 3], &device)
            .unwrap()
            .unsqueeze(0)
            .unwrap();
        let states = model.forward_hidden_states(&ids).unwrap();

        assert_eq!(states.n_layers(), 3);
        assert_eq!(states.seq_len().unwrap(), 5);
        assert_eq!(states.get_layer(2).unwrap().dims(), &[5, 8]);
        assert_eq!(model.max_positions(), 32);
    }

    #[test]
    fn test_roberta_position_offset() {
        let device = Device::Cpu;
        let mut config = tiny_config();
        config.pad_token_id = 1;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = CtxrepBert::load(&config, BertFlavor::Roberta, vb, &[""]).unwrap();

        // Positions 2..32 are addressable
        assert_eq!(model.max_positions(), 30);
        let ids = Tensor::new(&[0u32; 30], &device).unwrap().unsqueeze(0).unwrap();
        assert!(model.forward_hidden_states(&ids).is_ok());
    }

    #[test]
    fn test_layer_norm_legacy_names() {
        let device = Device::Cpu;
        let mut tensors = HashMap::new();
        tensors.insert(
            "ln.gamma".to_string(),
            Tensor::ones(4, DType::F32, &device).unwrap(),
        );
        tensors.insert(
            "ln.beta".to_string(),
            Tensor::zeros(4, DType::F32, &device).unwrap(),
        );
        let vb = VarBuilder::from_tensors(tensors, DType::F32, &device);

        let ln = layer_norm(4, 1e-5, vb.pp("ln")).unwrap();
        let x = Tensor::new(&[[1f32, 2., 3., 4.]], &device).unwrap();
        let y: Vec<Vec<f32>> = ln.forward(&x).unwrap().to_vec2().unwrap();
        let mean: f32 = y[0].iter().sum::<f32>() / 4.0;
        assert!(mean.abs() < 1e-5);
    }

    #[test]
    fn test_activation_names() {
        let x = Tensor::new(&[-1f32, 0., 1.], &Device::Cpu).unwrap();
        let relu: Vec<f32> = activation("relu", &x).unwrap().to_vec1().unwrap();
        assert_eq!(relu, vec![0.0, 0.0, 1.0]);
        assert!(activation("gelu", &x).is_ok());
        assert!(activation("gelu_new", &x).is_ok());
        assert!(activation("mish-ish", &x).is_err());
    }
}
