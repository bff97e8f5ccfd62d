//! CLIP byte-pair-encoding tokenizer.
//!
//! Loads the vocabulary (JSON object of token to id) and the ordered
//! merges list, then encodes text into fixed-length id sequences:
//! `[BOS] + pieces + [EOS]`, right-padded with 0 to the context length.

use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Mutex;

use crate::error::ConfigError;

/// Literal start-of-text marker recognized in raw input.
pub const BOS_TOKEN: &str = "<|startoftext|>";

/// Literal end-of-text marker recognized in raw input.
pub const EOS_TOKEN: &str = "<|endoftext|>";

const CONTRACTIONS: [&str; 7] = ["'s", "'t", "'re", "'ve", "'m", "'ll", "'d"];

#[derive(Debug)]
pub struct ClipBpeTokenizer {
    encoder: HashMap<String, i64>,
    ranks: HashMap<(String, String), usize>,
    bos_id: i64,
    eos_id: i64,
    context_len: usize,
    /// Per-token piece-id memo. BPE is deterministic, so results are
    /// cached for the tokenizer's lifetime.
    cache: Mutex<HashMap<String, Vec<i64>>>,
}

impl ClipBpeTokenizer {
    /// Load a tokenizer from a vocab JSON and a merges text file.
    ///
    /// The merges file's first line is a header and is skipped; every
    /// following non-empty line must hold exactly two whitespace-separated
    /// fields.
    pub fn from_files(
        vocab_path: &Path,
        merges_path: &Path,
        context_len: usize,
    ) -> Result<Self, ConfigError> {
        if context_len < 2 {
            return Err(ConfigError::Validation(format!(
                "CLIP context length {context_len} cannot fit BOS and EOS"
            )));
        }
        let vocab_file = File::open(vocab_path)?;
        let encoder: HashMap<String, i64> = serde_json::from_reader(BufReader::new(vocab_file))
            .map_err(|e| {
                ConfigError::Validation(format!(
                    "vocab at {} is not a token-to-id JSON object: {e}",
                    vocab_path.display()
                ))
            })?;

        let bos_id = *encoder
            .get(BOS_TOKEN)
            .ok_or_else(|| ConfigError::VocabMissing {
                path: vocab_path.to_path_buf(),
                token: BOS_TOKEN.to_string(),
            })?;
        let eos_id = *encoder
            .get(EOS_TOKEN)
            .ok_or_else(|| ConfigError::VocabMissing {
                path: vocab_path.to_path_buf(),
                token: EOS_TOKEN.to_string(),
            })?;

        let merges_text = std::fs::read_to_string(merges_path)?;
        let mut ranks = HashMap::new();
        for (line_no, line) in merges_text.lines().enumerate().skip(1) {
            if line.trim().is_empty() {
                continue;
            }
            let mut fields = line.split_whitespace();
            let (Some(left), Some(right), None) = (fields.next(), fields.next(), fields.next())
            else {
                return Err(ConfigError::MergesMalformed {
                    path: merges_path.to_path_buf(),
                    line: line_no + 1,
                });
            };
            ranks.insert((left.to_string(), right.to_string()), ranks.len());
        }

        tracing::debug!(
            vocab = %vocab_path.display(),
            tokens = encoder.len(),
            merges = ranks.len(),
            "loaded CLIP BPE tokenizer"
        );

        Ok(Self {
            encoder,
            ranks,
            bos_id,
            eos_id,
            context_len,
            cache: Mutex::new(HashMap::new()),
        })
    }

    /// Fixed output sequence length.
    pub fn context_len(&self) -> usize {
        self.context_len
    }

    /// Encode text into exactly `context_len` ids.
    ///
    /// Content ids beyond `context_len - 2` are truncated so that the
    /// terminal `[EOS]` always fits.
    pub fn encode(&self, text: &str) -> Vec<i64> {
        let lowered = text.to_lowercase();
        let mut ids: Vec<i64> = Vec::new();
        for token in scan_tokens(&lowered) {
            if token == BOS_TOKEN {
                ids.push(self.bos_id);
                continue;
            }
            if token == EOS_TOKEN {
                ids.push(self.eos_id);
                continue;
            }
            ids.extend_from_slice(&self.piece_ids(&token));
        }

        ids.truncate(self.context_len - 2);
        let mut out = Vec::with_capacity(self.context_len);
        out.push(self.bos_id);
        out.append(&mut ids);
        out.push(self.eos_id);
        out.resize(self.context_len, 0);
        out
    }

    fn piece_ids(&self, token: &str) -> Vec<i64> {
        if let Some(cached) = self.cache.lock().expect("bpe cache poisoned").get(token) {
            return cached.clone();
        }

        let ids: Vec<i64> = self
            .bpe(token)
            .into_iter()
            .filter_map(|piece| {
                let id = self.encoder.get(&piece).copied();
                if id.is_none() {
                    tracing::trace!(piece = %piece, "piece absent from vocabulary, skipped");
                }
                id
            })
            .collect();

        self.cache
            .lock()
            .expect("bpe cache poisoned")
            .insert(token.to_string(), ids.clone());
        ids
    }

    /// Run byte-pair merging over one scanned token.
    ///
    /// Initial units are the token's characters, the last carrying the
    /// `</w>` suffix; the adjacent pair with the lowest merge rank is
    /// merged until no listed pair remains.
    fn bpe(&self, token: &str) -> Vec<String> {
        let mut word: Vec<String> = token.chars().map(|c| c.to_string()).collect();
        let Some(last) = word.last_mut() else {
            return Vec::new();
        };
        last.push_str("</w>");

        while word.len() > 1 {
            let mut best: Option<(usize, (String, String))> = None;
            for pair in word.windows(2) {
                let key = (pair[0].clone(), pair[1].clone());
                if let Some(&rank) = self.ranks.get(&key) {
                    if best.as_ref().map_or(true, |(r, _)| rank < *r) {
                        best = Some((rank, key));
                    }
                }
            }
            let Some((_, (left, right))) = best else { break };

            let mut merged = Vec::with_capacity(word.len());
            let mut i = 0;
            while i < word.len() {
                if i + 1 < word.len() && word[i] == left && word[i + 1] == right {
                    merged.push(format!("{left}{right}"));
                    i += 2;
                } else {
                    merged.push(word[i].clone());
                    i += 1;
                }
            }
            word = merged;
        }
        word
    }
}

/// Split cleaned text into BPE input tokens.
///
/// Matches, in order: the literal BOS/EOS markers, English contractions,
/// Unicode letter runs, single digits, and runs of remaining non-space
/// characters.
fn scan_tokens(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut rest = text;
    while let Some(c) = rest.chars().next() {
        if c.is_whitespace() {
            rest = &rest[c.len_utf8()..];
            continue;
        }
        if rest.starts_with(BOS_TOKEN) {
            tokens.push(BOS_TOKEN.to_string());
            rest = &rest[BOS_TOKEN.len()..];
            continue;
        }
        if rest.starts_with(EOS_TOKEN) {
            tokens.push(EOS_TOKEN.to_string());
            rest = &rest[EOS_TOKEN.len()..];
            continue;
        }
        if c == '\'' {
            if let Some(suffix) = CONTRACTIONS.iter().find(|s| rest.starts_with(**s)) {
                tokens.push((*suffix).to_string());
                rest = &rest[suffix.len()..];
                continue;
            }
        }
        if c.is_alphabetic() {
            let end = rest
                .find(|ch: char| !ch.is_alphabetic())
                .unwrap_or(rest.len());
            tokens.push(rest[..end].to_string());
            rest = &rest[end..];
            continue;
        }
        if c.is_numeric() {
            tokens.push(c.to_string());
            rest = &rest[c.len_utf8()..];
            continue;
        }
        let end = rest
            .find(|ch: char| ch.is_whitespace() || ch.is_alphabetic() || ch.is_numeric())
            .unwrap_or(rest.len());
        tokens.push(rest[..end].to_string());
        rest = &rest[end..];
    }
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture_tokenizer(context_len: usize) -> (tempfile::TempDir, ClipBpeTokenizer) {
        let dir = tempfile::tempdir().unwrap();
        let (vocab, merges) = crate::tokenizer::tests::write_clip_fixtures(dir.path());
        let tok = ClipBpeTokenizer::from_files(&vocab, &merges, context_len).unwrap();
        (dir, tok)
    }

    #[test]
    fn test_scan_splits_letters_digits_punct() {
        assert_eq!(scan_tokens("a cube!"), vec!["a", "cube", "!"]);
        assert_eq!(scan_tokens("12"), vec!["1", "2"]);
        assert_eq!(scan_tokens("it's"), vec!["it", "'s"]);
        // A punctuation run stops at letters, so the contraction becomes
        // a bare letter after the apostrophe is consumed by the run.
        assert_eq!(scan_tokens("!!'s"), vec!["!!'", "s"]);
    }

    #[test]
    fn test_scan_recognizes_literal_markers() {
        assert_eq!(
            scan_tokens("<|startoftext|>a<|endoftext|>"),
            vec![BOS_TOKEN, "a", EOS_TOKEN]
        );
    }

    #[test]
    fn test_empty_prompt_is_bos_eos_padded() {
        let (_dir, tok) = fixture_tokenizer(77);
        let ids = tok.encode("");
        assert_eq!(ids.len(), 77);
        assert_eq!(ids[0], 0); // <|startoftext|>
        assert_eq!(ids[1], 1); // <|endoftext|>
        assert!(ids[2..].iter().all(|&id| id == 0));
    }

    #[test]
    fn test_encode_merges_to_known_pieces() {
        let (_dir, tok) = fixture_tokenizer(77);
        // "cube" merges c+u then cu+be</w> into the single piece cube</w>.
        let ids = tok.encode("a cube");
        assert_eq!(&ids[..4], &[0, 9, 20, 1]);
    }

    #[test]
    fn test_encode_lowercases_input() {
        let (_dir, tok) = fixture_tokenizer(77);
        assert_eq!(tok.encode("A CUBE"), tok.encode("a cube"));
    }

    #[test]
    fn test_encode_truncates_but_keeps_terminal_eos() {
        let (_dir, tok) = fixture_tokenizer(6);
        // Six single-letter words produce more content than fits.
        let ids = tok.encode("a b c d e a");
        assert_eq!(ids.len(), 6);
        assert_eq!(ids[0], 0);
        assert_eq!(ids[5], 1);
        // Content ids are capped at context_len - 2.
        assert!(ids[1..5].iter().all(|&id| id != 0 && id != 1));
    }

    #[test]
    fn test_contraction_encodes_via_merge() {
        let (_dir, tok) = fixture_tokenizer(77);
        let ids = tok.encode("'s");
        assert_eq!(&ids[..3], &[0, 22, 1]);
    }

    #[test]
    fn test_bpe_cache_is_consistent() {
        let (_dir, tok) = fixture_tokenizer(77);
        let first = tok.encode("cube cube cube");
        let second = tok.encode("cube cube cube");
        assert_eq!(first, second);
    }

    #[test]
    fn test_missing_bos_fails_construction() {
        let dir = tempfile::tempdir().unwrap();
        let vocab_path = dir.path().join("vocab.json");
        std::fs::write(&vocab_path, br#"{"<|endoftext|>": 0, "a": 1}"#).unwrap();
        let merges_path = dir.path().join("merges.txt");
        std::fs::write(&merges_path, "#version: 0.2\n").unwrap();

        let err = ClipBpeTokenizer::from_files(&vocab_path, &merges_path, 77).unwrap_err();
        match err {
            ConfigError::VocabMissing { token, .. } => assert_eq!(token, BOS_TOKEN),
            other => panic!("expected VocabMissing, got {other:?}"),
        }
    }

    #[test]
    fn test_malformed_merges_line_fails_construction() {
        let dir = tempfile::tempdir().unwrap();
        let vocab_path = dir.path().join("vocab.json");
        std::fs::write(
            &vocab_path,
            br#"{"<|startoftext|>": 0, "<|endoftext|>": 1}"#,
        )
        .unwrap();
        let merges_path = dir.path().join("merges.txt");
        std::fs::write(&merges_path, "#version: 0.2\na b\nonlyone\n").unwrap();

        let err = ClipBpeTokenizer::from_files(&vocab_path, &merges_path, 77).unwrap_err();
        match err {
            ConfigError::MergesMalformed { line, .. } => assert_eq!(line, 3),
            other => panic!("expected MergesMalformed, got {other:?}"),
        }
    }
}
