use super::MemoryError;

pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = 256;

const BIGRAM_WEIGHT: f32 = 0.5;

/// Turns text into a fixed-width vector. Records keep the vector assigned at
/// write time; swapping embedders means re-seeding memory.
pub trait Embedder: Send + Sync {
    fn dimensions(&self) -> usize;
    fn embed(&self, text: &str) -> Result<Vec<f32>, MemoryError>;
}

/// Deterministic feature-hashing embedder over lowercase word unigrams and
/// adjacent bigrams. Needs no model and gives stable scores across restarts.
#[derive(Clone, Debug)]
pub struct HashingEmbedder {
    dimensions: usize,
}

impl HashingEmbedder {
    pub fn new(dimensions: usize) -> Result<Self, MemoryError> {
        if dimensions == 0 {
            return Err(MemoryError::InvalidInput(
                "embedding dimensions must be greater than zero".to_string(),
            ));
        }
        Ok(Self { dimensions })
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self { dimensions: DEFAULT_EMBEDDING_DIMENSIONS }
    }
}

impl Embedder for HashingEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>, MemoryError> {
        let tokens = tokenize(text);
        let mut vector = vec![0.0f32; self.dimensions];

        for token in &tokens {
            self.accumulate(&mut vector, token, 1.0);
        }
        for pair in tokens.windows(2) {
            self.accumulate(&mut vector, &format!("{} {}", pair[0], pair[1]), BIGRAM_WEIGHT);
        }

        normalize(&mut vector);
        Ok(vector)
    }
}

impl HashingEmbedder {
    fn accumulate(&self, vector: &mut [f32], feature: &str, weight: f32) {
        let hash = blake3::hash(feature.as_bytes());
        let bytes = hash.as_bytes();
        let mut bucket_bytes = [0u8; 8];
        bucket_bytes.copy_from_slice(&bytes[..8]);
        let bucket = (u64::from_le_bytes(bucket_bytes) % self.dimensions as u64) as usize;
        let sign = if bytes[8] & 1 == 0 { 1.0 } else { -1.0 };
        vector[bucket] += sign * weight;
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.split(|ch: char| !ch.is_alphanumeric() && ch != '_')
        .filter(|token| !token.is_empty())
        .map(str::to_lowercase)
        .collect()
}

fn normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
    if norm > 0.0 {
        for value in vector.iter_mut() {
            *value /= norm;
        }
    }
}

/// Cosine similarity clamped into `[0, 1]`. Mismatched widths and zero
/// vectors score zero.
pub fn cosine_similarity(left: &[f32], right: &[f32]) -> f32 {
    if left.len() != right.len() || left.is_empty() {
        return 0.0;
    }
    let dot: f32 = left.iter().zip(right).map(|(a, b)| a * b).sum();
    let left_norm = left.iter().map(|value| value * value).sum::<f32>().sqrt();
    let right_norm = right.iter().map(|value| value * value).sum::<f32>().sqrt();
    if left_norm == 0.0 || right_norm == 0.0 {
        return 0.0;
    }
    (dot / (left_norm * right_norm)).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::{cosine_similarity, Embedder, HashingEmbedder};

    #[test]
    fn identical_text_scores_one() {
        let embedder = HashingEmbedder::default();
        let a = embedder.embed("Total sales last month").expect("embed");
        let b = embedder.embed("total   SALES, last month").expect("embed");
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn related_text_outscores_unrelated_text() {
        let embedder = HashingEmbedder::default();
        let query = embedder.embed("what were total sales last month").expect("embed");
        let related = embedder.embed("total sales for last month by region").expect("embed");
        let unrelated = embedder.embed("warehouse inventory pick list").expect("embed");

        assert!(cosine_similarity(&query, &related) > cosine_similarity(&query, &unrelated));
    }

    #[test]
    fn vectors_have_configured_width_and_unit_norm() {
        let embedder = HashingEmbedder::new(64).expect("valid width");
        let vector = embedder.embed("churn definition").expect("embed");
        let norm = vector.iter().map(|value| value * value).sum::<f32>().sqrt();

        assert_eq!(vector.len(), 64);
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn empty_text_and_mismatched_widths_score_zero() {
        let embedder = HashingEmbedder::default();
        let empty = embedder.embed("   ").expect("embed");
        let full = embedder.embed("orders").expect("embed");

        assert_eq!(cosine_similarity(&empty, &full), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0]), 0.0);
    }

    #[test]
    fn zero_width_is_rejected() {
        assert!(HashingEmbedder::new(0).is_err());
    }
}
