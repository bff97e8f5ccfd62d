//! Word-level WordPiece tokenizer for the semantic text encoder.
//!
//! The vocabulary is a plain text file, one token per line; a token's id is
//! its line index. Encoding is whitespace-split, lowercased word lookup
//! with `[UNK]` for misses, bracketed by `[CLS]` and `[SEP]`.

use std::collections::HashMap;
use std::path::Path;

use crate::error::ConfigError;

const CLS_TOKEN: &str = "[CLS]";
const SEP_TOKEN: &str = "[SEP]";
const UNK_TOKEN: &str = "[UNK]";

#[derive(Debug)]
pub struct WordPieceTokenizer {
    vocab: HashMap<String, i64>,
    cls_id: i64,
    sep_id: i64,
    unk_id: i64,
    max_len: usize,
}

impl WordPieceTokenizer {
    /// Load a tokenizer from a line-indexed vocabulary file.
    pub fn from_file(vocab_path: &Path, max_len: usize) -> Result<Self, ConfigError> {
        if max_len < 2 {
            return Err(ConfigError::Validation(format!(
                "sequence length {max_len} cannot fit [CLS] and [SEP]"
            )));
        }
        let text = std::fs::read_to_string(vocab_path)?;
        let mut vocab = HashMap::new();
        for (id, line) in text.lines().enumerate() {
            vocab.insert(line.trim_end().to_string(), id as i64);
        }

        let special = |token: &str| -> Result<i64, ConfigError> {
            vocab
                .get(token)
                .copied()
                .ok_or_else(|| ConfigError::VocabMissing {
                    path: vocab_path.to_path_buf(),
                    token: token.to_string(),
                })
        };
        let cls_id = special(CLS_TOKEN)?;
        let sep_id = special(SEP_TOKEN)?;
        let unk_id = special(UNK_TOKEN)?;

        tracing::debug!(
            vocab = %vocab_path.display(),
            tokens = vocab.len(),
            "loaded WordPiece tokenizer"
        );

        Ok(Self {
            vocab,
            cls_id,
            sep_id,
            unk_id,
            max_len,
        })
    }

    /// Upper bound on the emitted sequence length.
    pub fn max_len(&self) -> usize {
        self.max_len
    }

    /// Encode text into ids plus a same-length attention mask of ones.
    ///
    /// Output length varies with the input, bounded by `max_len`; padding
    /// to a common batch length (mask 0) is the batch assembler's job.
    pub fn encode(&self, text: &str) -> (Vec<i64>, Vec<i64>) {
        let lowered = text.to_lowercase();
        let mut ids = Vec::with_capacity(self.max_len.min(lowered.len() / 4 + 2));
        ids.push(self.cls_id);
        for word in lowered.split_whitespace() {
            if ids.len() == self.max_len - 1 {
                break;
            }
            ids.push(self.vocab.get(word).copied().unwrap_or(self.unk_id));
        }
        ids.push(self.sep_id);

        let mask = vec![1; ids.len()];
        (ids, mask)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture_vocab(dir: &Path, extra: &[&str]) -> std::path::PathBuf {
        // Line index is the id: [UNK] lands at 100, [CLS] at 101,
        // [SEP] at 102, payload tokens from 103.
        let mut lines: Vec<String> = (0..100).map(|i| format!("[unused{i}]")).collect();
        lines.push(UNK_TOKEN.to_string());
        lines.push(CLS_TOKEN.to_string());
        lines.push(SEP_TOKEN.to_string());
        lines.extend(extra.iter().map(|s| s.to_string()));
        let path = dir.join("vocab.txt");
        std::fs::write(&path, lines.join("\n")).unwrap();
        path
    }

    #[test]
    fn test_ids_follow_line_index() {
        let dir = tempfile::tempdir().unwrap();
        let path = fixture_vocab(dir.path(), &["red", "cube"]);
        let tok = WordPieceTokenizer::from_file(&path, 512).unwrap();

        let (ids, mask) = tok.encode("a red cube");
        // "a" is absent from the vocabulary and maps to [UNK].
        assert_eq!(ids, vec![101, 100, 103, 104, 102]);
        assert_eq!(mask, vec![1, 1, 1, 1, 1]);
    }

    #[test]
    fn test_encode_brackets_with_cls_sep() {
        let dir = tempfile::tempdir().unwrap();
        let path = fixture_vocab(dir.path(), &["red"]);
        let tok = WordPieceTokenizer::from_file(&path, 512).unwrap();

        let (ids, mask) = tok.encode("red");
        assert_eq!(ids, vec![101, 103, 102]);
        assert_eq!(mask.len(), ids.len());
    }

    #[test]
    fn test_empty_input_is_cls_sep() {
        let dir = tempfile::tempdir().unwrap();
        let path = fixture_vocab(dir.path(), &[]);
        let tok = WordPieceTokenizer::from_file(&path, 512).unwrap();

        let (ids, mask) = tok.encode("");
        assert_eq!(ids, vec![101, 102]);
        assert_eq!(mask, vec![1, 1]);
    }

    #[test]
    fn test_encode_lowercases_and_maps_unknowns() {
        let dir = tempfile::tempdir().unwrap();
        let path = fixture_vocab(dir.path(), &["red"]);
        let tok = WordPieceTokenizer::from_file(&path, 512).unwrap();

        let (ids, _) = tok.encode("RED zzz");
        assert_eq!(ids, vec![101, 103, 100, 102]);
    }

    #[test]
    fn test_encode_respects_max_len() {
        let dir = tempfile::tempdir().unwrap();
        let path = fixture_vocab(dir.path(), &["red"]);
        let tok = WordPieceTokenizer::from_file(&path, 6).unwrap();

        let (ids, mask) = tok.encode("red red red red red red red red");
        assert_eq!(ids.len(), 6);
        assert_eq!(mask.len(), 6);
        assert_eq!(ids[0], 101);
        assert_eq!(*ids.last().unwrap(), 102);
    }

    #[test]
    fn test_missing_special_token_fails_construction() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vocab.txt");
        std::fs::write(&path, "just\nsome\nwords").unwrap();

        let err = WordPieceTokenizer::from_file(&path, 512).unwrap_err();
        assert!(matches!(err, ConfigError::VocabMissing { .. }));
    }
}
