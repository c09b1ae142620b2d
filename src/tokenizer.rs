//! Token counting for throughput metrics.
//!
//! When a response does not carry an authoritative `usage` block we have
//! to estimate token counts ourselves. The backend is chosen per model at
//! first use: a real BPE tokenizer for known model families, and a
//! rule-based estimator for everything else. Counts are memoized by
//! `(sha256(text), model)` because load tests hammer the same prompts
//! over and over.

use std::{
    collections::HashMap,
    num::NonZeroUsize,
    sync::{Arc, Mutex, OnceLock},
};

use lru::LruCache;
use regex::Regex;
use sha2::{Digest, Sha256};
use tiktoken_rs::CoreBPE;

use crate::prelude::*;

const COUNT_CACHE_SIZE: usize = 10_000;

/// A tokenizer backend. Implementations may fail on exotic input; callers
/// fall back to [`fallback_estimate`].
trait TokenBackend: Send + Sync {
    fn count(&self, text: &str) -> Result<usize>;
}

struct BpeBackend(CoreBPE);

impl TokenBackend for BpeBackend {
    fn count(&self, text: &str) -> Result<usize> {
        Ok(self.0.encode_with_special_tokens(text).len())
    }
}

/// Rule-based estimator: CJK characters and emoji count one token per
/// codepoint, everything else splits into word and punctuation runs.
struct RuleBasedBackend {
    tokenizer_regex: Regex,
}

impl RuleBasedBackend {
    fn new() -> Self {
        RuleBasedBackend {
            tokenizer_regex: Regex::new(r"[\w]+|[^\w\s]")
                .expect("tokenizer regex should be valid"),
        }
    }

    fn is_cjk_or_emoji(c: char) -> bool {
        let cp = c as u32;
        (0x4E00..=0x9FFF).contains(&cp)
            || (0x1F600..=0x1F64F).contains(&cp)
            || (0x1F300..=0x1F5FF).contains(&cp)
            || (0x1F680..=0x1F6FF).contains(&cp)
            || (0x1F1E0..=0x1F1FF).contains(&cp)
            || (0x2600..=0x26FF).contains(&cp)
    }
}

impl TokenBackend for RuleBasedBackend {
    fn count(&self, text: &str) -> Result<usize> {
        let mut count = 0;
        for run in self.tokenizer_regex.find_iter(text) {
            let run = run.as_str();
            if run.chars().all(Self::is_cjk_or_emoji) {
                count += run.chars().count();
            } else {
                count += 1;
            }
        }
        Ok(count)
    }
}

/// Byte-ratio estimate used when a backend fails outright: CJK characters
/// run about 3 UTF-8 bytes per token, everything else about 4.
fn fallback_estimate(text: &str) -> u64 {
    let utf8_bytes = text.len() as i64;
    let chinese_chars = text
        .chars()
        .filter(|c| ('\u{4e00}'..='\u{9fff}').contains(c))
        .count() as i64;
    let estimate = chinese_chars + 0.max(utf8_bytes - 3 * chinese_chars) / 4;
    estimate.max(1) as u64
}

fn backends() -> &'static Mutex<HashMap<String, Arc<dyn TokenBackend>>> {
    static BACKENDS: OnceLock<Mutex<HashMap<String, Arc<dyn TokenBackend>>>> =
        OnceLock::new();
    BACKENDS.get_or_init(|| Mutex::new(HashMap::new()))
}

fn count_cache() -> &'static Mutex<LruCache<(String, String), u64>> {
    static CACHE: OnceLock<Mutex<LruCache<(String, String), u64>>> = OnceLock::new();
    CACHE.get_or_init(|| {
        Mutex::new(LruCache::new(
            NonZeroUsize::new(COUNT_CACHE_SIZE).expect("cache size is non-zero"),
        ))
    })
}

/// Pick a backend for `model`, caching the choice.
fn backend_for(model: &str) -> Arc<dyn TokenBackend> {
    let mut backends = backends().lock().expect("lock poisoned");
    if let Some(backend) = backends.get(model) {
        return backend.clone();
    }

    let lowered = model.to_ascii_lowercase();
    let backend: Arc<dyn TokenBackend> = if lowered.contains("gpt-4o") {
        match tiktoken_rs::o200k_base() {
            Ok(bpe) => Arc::new(BpeBackend(bpe)),
            Err(err) => {
                warn!(%model, "failed to load o200k tokenizer: {err}");
                Arc::new(RuleBasedBackend::new())
            }
        }
    } else if lowered.contains("gpt-4")
        || lowered.contains("gpt-3.5")
        || lowered.contains("claude")
    {
        // Claude tokenization is close enough to cl100k for throughput math.
        match tiktoken_rs::cl100k_base() {
            Ok(bpe) => Arc::new(BpeBackend(bpe)),
            Err(err) => {
                warn!(%model, "failed to load cl100k tokenizer: {err}");
                Arc::new(RuleBasedBackend::new())
            }
        }
    } else {
        Arc::new(RuleBasedBackend::new())
    };

    backends.insert(model.to_owned(), backend.clone());
    backend
}

/// Count the tokens in `text` for `model`.
///
/// Returns 0 iff `text` is empty or whitespace-only.
pub fn count_tokens(text: &str, model: &str) -> u64 {
    if text.trim().is_empty() {
        return 0;
    }

    let digest = format!("{:x}", Sha256::digest(text.as_bytes()));
    let key = (digest, model.to_owned());
    if let Some(count) = count_cache().lock().expect("lock poisoned").get(&key) {
        return *count;
    }

    let count = match backend_for(model).count(text) {
        Ok(count) => count as u64,
        Err(err) => {
            warn!(%model, "tokenization failed: {err}, falling back to estimation");
            fallback_estimate(text)
        }
    };

    count_cache()
        .lock()
        .expect("lock poisoned")
        .put(key, count);
    count
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_and_whitespace_count_zero() {
        assert_eq!(count_tokens("", "any-model"), 0);
        assert_eq!(count_tokens("   \n\t", "any-model"), 0);
    }

    #[test]
    fn rule_based_splits_words_and_punctuation() {
        let backend = RuleBasedBackend::new();
        // "Hello" "," "world" "!"
        assert_eq!(backend.count("Hello, world!").unwrap(), 4);
    }

    #[test]
    fn rule_based_counts_cjk_per_character() {
        let backend = RuleBasedBackend::new();
        assert_eq!(backend.count("你好世界").unwrap(), 4);
        // Mixed run: "hi" is one token, each CJK char is its own.
        assert_eq!(backend.count("hi 你好").unwrap(), 3);
    }

    #[test]
    fn rule_based_counts_emoji_per_character() {
        let backend = RuleBasedBackend::new();
        assert_eq!(backend.count("🚀🚀").unwrap(), 2);
    }

    #[test]
    fn fallback_clamps_to_at_least_one() {
        assert_eq!(fallback_estimate("a"), 1);
        // 12 ASCII bytes -> 3 estimated tokens.
        assert_eq!(fallback_estimate("abcdefghijkl"), 3);
        // Pure CJK: one token per character.
        assert_eq!(fallback_estimate("你好"), 2);
    }

    #[test]
    fn counts_are_cached_and_stable() {
        let first = count_tokens("stable text for caching", "custom-model");
        let second = count_tokens("stable text for caching", "custom-model");
        assert_eq!(first, second);
        assert!(first > 0);
    }
}
