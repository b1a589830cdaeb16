//! Optional embedding collaborator.

use crate::error::{Error, Result};

/// Computes an embedding for a piece of text.
///
/// When an engine has an embedder, records and queries that arrive without
/// an embedding get one from it. Callers that supply their own vectors never
/// trigger a call.
pub trait Embedder: Send + Sync {
    fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Embedder backed by a closure.
pub struct FnEmbedder<F>(F);

impl<F> FnEmbedder<F>
where
    F: Fn(&str) -> Result<Vec<f32>> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> Embedder for FnEmbedder<F>
where
    F: Fn(&str) -> Result<Vec<f32>> + Send + Sync,
{
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        (self.0)(text)
    }
}

/// Check that an embedding is usable: non-empty, finite and, when
/// `dimensions` is set, of that length.
pub fn validate_embedding(embedding: &[f32], dimensions: Option<usize>) -> Result<()> {
    if embedding.is_empty() {
        return Err(Error::invalid_argument("embedding must not be empty"));
    }
    if embedding.iter().any(|x| !x.is_finite()) {
        return Err(Error::invalid_argument("embedding must be finite"));
    }
    if let Some(dims) = dimensions {
        if embedding.len() != dims {
            return Err(Error::invalid_argument(format!(
                "embedding has {} dimensions, expected {}",
                embedding.len(),
                dims
            )));
        }
    }
    Ok(())
}

/// Embed `text` and reject output that fails [`validate_embedding`].
pub fn embed_checked(
    embedder: &dyn Embedder,
    text: &str,
    dimensions: Option<usize>,
) -> Result<Vec<f32>> {
    let embedding = embedder.embed(text)?;
    validate_embedding(&embedding, dimensions)?;
    Ok(embedding)
}
