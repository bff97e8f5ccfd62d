//! Text tokenization for the encoder sessions.
//!
//! Two variants, both pure after construction:
//! - **clip_bpe**: byte-pair encoding over a vocab JSON and merges list,
//!   producing fixed-length 77-token sequences for the CLIP text encoders.
//! - **wordpiece**: line-indexed vocabulary lookup producing bounded
//!   variable-length sequences plus attention masks for the semantic
//!   encoder.

pub(crate) mod clip_bpe;
pub(crate) mod wordpiece;

pub use clip_bpe::ClipBpeTokenizer;
pub use wordpiece::WordPieceTokenizer;

/// A tokenizer bound to one text encoder session.
pub enum TextTokenizer {
    ClipBpe(ClipBpeTokenizer),
    WordPiece(WordPieceTokenizer),
}

/// Token ids plus a same-length attention mask (1 = real, 0 = pad).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenizedText {
    pub input_ids: Vec<i64>,
    pub attention_mask: Vec<i64>,
}

impl TextTokenizer {
    /// Encode one text into ids and a mask.
    ///
    /// CLIP output is always exactly the context length; wordpiece output
    /// is as long as the input needs, bounded by the configured maximum.
    pub fn encode(&self, text: &str) -> TokenizedText {
        match self {
            TextTokenizer::ClipBpe(t) => {
                let input_ids = t.encode(text);
                let attention_mask = vec![1; input_ids.len()];
                TokenizedText {
                    input_ids,
                    attention_mask,
                }
            }
            TextTokenizer::WordPiece(t) => {
                let (input_ids, attention_mask) = t.encode(text);
                TokenizedText {
                    input_ids,
                    attention_mask,
                }
            }
        }
    }

    /// Whether the bound encoder expects an attention_mask input.
    pub fn wants_attention_mask(&self) -> bool {
        matches!(self, TextTokenizer::WordPiece(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    pub(super) fn write_clip_fixtures(dir: &std::path::Path) -> (std::path::PathBuf, std::path::PathBuf) {
        // A miniature vocabulary: single characters, end-of-word variants,
        // and a few merged tokens, ids assigned densely.
        let vocab = serde_json::json!({
            "<|startoftext|>": 0,
            "<|endoftext|>": 1,
            "a": 2, "b": 3, "c": 4, "d": 5, "e": 6, "r": 7, "u": 8,
            "a</w>": 9, "b</w>": 10, "c</w>": 11, "d</w>": 12, "e</w>": 13,
            "r</w>": 14, "u</w>": 15,
            "re": 16, "re</w>": 17, "be</w>": 18, "cu": 19, "cube</w>": 20,
            "be": 21, "'s</w>": 22, "'": 23, "s</w>": 24, "s": 25,
            "1</w>": 26, "!</w>": 27, "!": 28, "1": 29
        });
        let vocab_path = dir.join("vocab.json");
        std::fs::write(&vocab_path, serde_json::to_vec(&vocab).unwrap()).unwrap();

        let merges_path = dir.join("merges.txt");
        let mut merges = std::fs::File::create(&merges_path).unwrap();
        writeln!(merges, "#version: 0.2").unwrap();
        writeln!(merges, "r e").unwrap();
        writeln!(merges, "c u").unwrap();
        writeln!(merges, "b e</w>").unwrap();
        writeln!(merges, "cu be</w>").unwrap();
        writeln!(merges, "' s</w>").unwrap();
        drop(merges);

        (vocab_path, merges_path)
    }

    #[test]
    fn test_variant_mask_behavior() {
        let dir = tempfile::tempdir().unwrap();
        let (vocab, merges) = write_clip_fixtures(dir.path());
        let clip = TextTokenizer::ClipBpe(ClipBpeTokenizer::from_files(&vocab, &merges, 77).unwrap());
        assert!(!clip.wants_attention_mask());

        let out = clip.encode("a cube");
        assert_eq!(out.input_ids.len(), 77);
        assert_eq!(out.attention_mask.len(), 77);
        assert!(out.attention_mask.iter().all(|&m| m == 1));
    }
}
