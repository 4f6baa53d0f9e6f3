use std::path::Path;

use anyhow::{Context, Error, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::Module;
use candle_transformers::models::stable_diffusion::{
    self,
    clip::{ClipTextTransformer, Config as ClipConfig},
};
use tokenizers::Tokenizer;
use tracing::warn;

/// Keeps the first `max_len - 1` tokens followed by the last one, the end-of-text token CLIP
/// pools from.
fn truncate_tokens(tokens: &mut Vec<u32>, max_len: usize) {
    if tokens.len() <= max_len || max_len == 0 {
        tokens.truncate(max_len);
        return;
    }
    let last = tokens[tokens.len() - 1];
    tokens.truncate(max_len - 1);
    tokens.push(last);
}

/// A CLIP tokenizer and text transformer pair.
pub(crate) struct TextEncoder {
    tokenizer: Tokenizer,
    model: ClipTextTransformer,
    pad_id: u32,
    max_len: usize,
}

impl TextEncoder {
    pub(crate) fn new(
        config: &ClipConfig,
        weights: &Path,
        tokenizer: &Path,
        device: &Device,
    ) -> Result<Self> {
        let tokenizer = Tokenizer::from_file(tokenizer)
            .map_err(Error::msg)
            .context("failed to load CLIP tokenizer")?;
        let pad = config.pad_with.as_deref().unwrap_or("<|endoftext|>");
        let pad_id = *tokenizer
            .get_vocab(true)
            .get(pad)
            .with_context(|| format!("padding token {pad} missing from tokenizer"))?;
        // Kept in f32, the embeddings are cast to the pipeline dtype afterwards.
        let model = stable_diffusion::build_clip_transformer(config, weights, device, DType::F32)
            .context("failed to load CLIP model")?;
        Ok(Self {
            tokenizer,
            model,
            pad_id,
            max_len: config.max_position_embeddings,
        })
    }

    fn embed(&self, text: &str, device: &Device) -> Result<Tensor> {
        let mut tokens = self
            .tokenizer
            .encode(text, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        if tokens.len() > self.max_len {
            warn!(
                tokens = tokens.len(),
                max = self.max_len,
                "prompt too long, truncating"
            );
            truncate_tokens(&mut tokens, self.max_len);
        }
        tokens.resize(self.max_len, self.pad_id);
        let tokens = Tensor::new(tokens.as_slice(), device)?.unsqueeze(0)?;
        Ok(self.model.forward(&tokens)?)
    }

    /// Prompt embeddings, preceded along the batch dimension by the negative prompt's when
    /// classifier-free guidance is used.
    pub(crate) fn encode(
        &self,
        prompt: &str,
        negative_prompt: &str,
        use_guidance: bool,
        device: &Device,
        dtype: DType,
    ) -> Result<Tensor> {
        let cond = self.embed(prompt, device)?;
        let embeddings = if use_guidance {
            let uncond = self.embed(negative_prompt, device)?;
            Tensor::cat(&[uncond, cond], 0)?
        } else {
            cond
        };
        Ok(embeddings.to_dtype(dtype)?)
    }
}
