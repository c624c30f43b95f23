use tokenizers::{Tokenizer, TokenizerImpl};

/// Clean and normalize a sentence before tokenization.
///
/// Control characters are removed and runs of whitespace collapse to a single
/// space. A sentence made only of whitespace normalizes to the empty string.
pub fn normalize_text(text: &str) -> String {
    text.chars()
        .map(|c| if c == '\t' || c == '\n' || c == '\r' { ' ' } else { c })
        .filter(|c| !c.is_control())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Maps normalized text to token ids.
///
/// Implementations must be pure: the same text always yields the same ids,
/// and they are shared read-only across tokenization workers.
pub trait TokenEncoder: Send + Sync {
    fn encode(&self, text: &str) -> std::result::Result<Vec<u32>, String>;

    fn pad_id(&self) -> u32 {
        0
    }
}

impl TokenEncoder for Tokenizer {
    fn encode(&self, text: &str) -> std::result::Result<Vec<u32>, String> {
        // `Tokenizer` derefs to `TokenizerImpl`, whose inherent `encode` takes
        // the special-token flag.
        TokenizerImpl::encode(&**self, text, false)
            .map(|encoding| encoding.get_ids().to_vec())
            .map_err(|err| err.to_string())
    }

    fn pad_id(&self) -> u32 {
        self.get_padding().map(|p| p.pad_id).unwrap_or(0)
    }
}

/// Feature-hashing encoder over whitespace-separated, lowercased words.
///
/// Needs no vocabulary file. Ids `0` and `1` are reserved for padding and the
/// sentence-start marker, so word ids fall in `2..vocab_size`.
#[derive(Debug, Clone)]
pub struct HashedWordEncoder {
    vocab_size: u32,
}

impl HashedWordEncoder {
    pub const PAD_ID: u32 = 0;
    pub const START_ID: u32 = 1;

    pub fn new(vocab_size: u32) -> Self {
        Self {
            vocab_size: vocab_size.max(3),
        }
    }

    pub fn vocab_size(&self) -> u32 {
        self.vocab_size
    }

    fn word_id(&self, word: &str) -> u32 {
        // FNV-1a
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in word.to_lowercase().bytes() {
            hash ^= u64::from(byte);
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        2 + (hash % u64::from(self.vocab_size - 2)) as u32
    }
}

impl TokenEncoder for HashedWordEncoder {
    fn encode(&self, text: &str) -> std::result::Result<Vec<u32>, String> {
        let mut ids = vec![Self::START_ID];
        ids.extend(text.split_whitespace().map(|w| self.word_id(w)));
        Ok(ids)
    }

    fn pad_id(&self) -> u32 {
        Self::PAD_ID
    }
}

/// Fixed-length token ids with a validity mask.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenizedText {
    pub input_ids: Vec<u32>,
    pub attention_mask: Vec<u32>,
}

impl TokenizedText {
    pub fn valid_len(&self) -> usize {
        self.attention_mask.iter().filter(|m| **m != 0).count()
    }
}

/// Truncate or pad `ids` to `max_length`.
pub fn pad_to_length(mut ids: Vec<u32>, max_length: usize, pad_id: u32) -> TokenizedText {
    ids.truncate(max_length);
    let valid = ids.len();
    ids.resize(max_length, pad_id);
    let mut attention_mask = vec![1u32; valid];
    attention_mask.resize(max_length, 0);
    TokenizedText {
        input_ids: ids,
        attention_mask,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_collapses_whitespace_and_controls() {
        assert_eq!(normalize_text("  Hello    world  "), "Hello world");
        assert_eq!(normalize_text("Text\twith\ttabs"), "Text with tabs");
        assert_eq!(normalize_text("bell\u{7}char"), "bellchar");
        assert_eq!(normalize_text(" \t\n "), "");
    }

    #[test]
    fn hashed_encoder_is_stable_and_in_range() {
        let encoder = HashedWordEncoder::new(64);
        let a = encoder.encode("The cell divides").unwrap();
        let b = encoder.encode("the CELL divides").unwrap();
        assert_eq!(a, b);
        assert_eq!(a[0], HashedWordEncoder::START_ID);
        assert!(a[1..].iter().all(|id| (2..64).contains(id)));
    }

    const WORD_LEVEL: &str = r#"{
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [],
        "normalizer": null,
        "pre_tokenizer": { "type": "Whitespace" },
        "post_processor": null,
        "decoder": null,
        "model": {
            "type": "WordLevel",
            "vocab": { "[UNK]": 0, "[PAD]": 1, "the": 2, "cell": 3, "divides": 4 },
            "unk_token": "[UNK]"
        }
    }"#;

    #[test]
    fn vocabulary_tokenizer_encodes_words() {
        let tokenizer: Tokenizer = WORD_LEVEL.parse().unwrap();
        let ids = TokenEncoder::encode(&tokenizer, "the cell divides quickly").unwrap();
        assert_eq!(ids, vec![2, 3, 4, 0]);
        assert_eq!(TokenEncoder::pad_id(&tokenizer), 0);
    }

    #[test]
    fn vocabulary_tokenizer_reports_its_padding_id() {
        let mut tokenizer: Tokenizer = WORD_LEVEL.parse().unwrap();
        tokenizer.with_padding(Some(tokenizers::PaddingParams {
            pad_id: 1,
            pad_token: "[PAD]".to_string(),
            ..Default::default()
        }));
        assert_eq!(TokenEncoder::pad_id(&tokenizer), 1);
        let text = pad_to_length(TokenEncoder::encode(&tokenizer, "cell").unwrap(), 3, 1);
        assert_eq!(text.input_ids, vec![3, 1, 1]);
    }

    #[test]
    fn pads_and_truncates() {
        let short = pad_to_length(vec![5, 6], 4, 0);
        assert_eq!(short.input_ids, vec![5, 6, 0, 0]);
        assert_eq!(short.attention_mask, vec![1, 1, 0, 0]);
        assert_eq!(short.valid_len(), 2);

        let long = pad_to_length(vec![1, 2, 3, 4, 5], 3, 0);
        assert_eq!(long.input_ids, vec![1, 2, 3]);
        assert_eq!(long.attention_mask, vec![1, 1, 1]);
    }
}
