//! Pipeline knobs. Environment first (`ASKPIPE_*`), CLI flags override.

use std::str::FromStr;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

pub(crate) fn env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn env_parse<T: FromStr>(key: &'static str) -> Result<Option<T>, ConfigError> {
    match env(key) {
        None => Ok(None),
        Some(v) => v
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { key, value: v }),
    }
}

/// Hard upper bound on filtered documents handed to synthesis.
pub const MAX_FILTER_CAP: usize = 8;

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// In-flight queries during retrieval.
    pub concurrency: usize,
    pub urls_per_query: usize,
    pub fetch_timeout_ms: u64,
    pub search_timeout_ms: u64,
    pub llm_timeout_ms: u64,
    pub filter_cap: usize,
    pub excerpt_chars: usize,
    /// Below this many excerpt chars the answer comes from conversation context.
    pub min_evidence_chars: usize,
    pub thorough_min_words: usize,
    pub thin_source_threshold: usize,
    pub plan_history_turns: usize,
    pub synth_history_turns: usize,
    pub search_retries: u32,
    pub search_backoff_ms: u64,
    pub search_cache_ttl_s: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            urls_per_query: 5,
            fetch_timeout_ms: 30_000,
            search_timeout_ms: 20_000,
            llm_timeout_ms: 90_000,
            filter_cap: MAX_FILTER_CAP,
            excerpt_chars: 2_000,
            min_evidence_chars: 400,
            thorough_min_words: 4_000,
            thin_source_threshold: 4,
            plan_history_turns: 6,
            synth_history_turns: 10,
            search_retries: 2,
            search_backoff_ms: 200,
            search_cache_ttl_s: 120,
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut c = Self::default();
        macro_rules! read {
            ($field:ident, $key:literal) => {
                if let Some(v) = env_parse($key)? {
                    c.$field = v;
                }
            };
        }
        read!(concurrency, "ASKPIPE_CONCURRENCY");
        read!(urls_per_query, "ASKPIPE_URLS_PER_QUERY");
        read!(fetch_timeout_ms, "ASKPIPE_FETCH_TIMEOUT_MS");
        read!(search_timeout_ms, "ASKPIPE_SEARCH_TIMEOUT_MS");
        read!(llm_timeout_ms, "ASKPIPE_LLM_TIMEOUT_MS");
        read!(filter_cap, "ASKPIPE_FILTER_CAP");
        read!(excerpt_chars, "ASKPIPE_EXCERPT_CHARS");
        read!(min_evidence_chars, "ASKPIPE_MIN_EVIDENCE_CHARS");
        read!(thorough_min_words, "ASKPIPE_THOROUGH_MIN_WORDS");
        read!(thin_source_threshold, "ASKPIPE_THIN_SOURCE_THRESHOLD");
        read!(plan_history_turns, "ASKPIPE_PLAN_HISTORY_TURNS");
        read!(synth_history_turns, "ASKPIPE_SYNTH_HISTORY_TURNS");
        read!(search_retries, "ASKPIPE_SEARCH_RETRIES");
        read!(search_backoff_ms, "ASKPIPE_SEARCH_BACKOFF_MS");
        read!(search_cache_ttl_s, "ASKPIPE_SEARCH_CACHE_TTL_S");
        Ok(c.sanitized())
    }

    /// Clamp values into ranges the pipeline can honor.
    pub fn sanitized(mut self) -> Self {
        self.concurrency = self.concurrency.clamp(1, 5);
        self.urls_per_query = self.urls_per_query.clamp(1, 10);
        self.filter_cap = self.filter_cap.clamp(1, MAX_FILTER_CAP);
        self.excerpt_chars = self.excerpt_chars.max(100);
        self.fetch_timeout_ms = self.fetch_timeout_ms.max(1);
        self.search_timeout_ms = self.search_timeout_ms.max(1);
        self.llm_timeout_ms = self.llm_timeout_ms.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let c = PipelineConfig::default();
        assert_eq!(c.concurrency, 5);
        assert_eq!(c.fetch_timeout_ms, 30_000);
        assert_eq!(c.filter_cap, 8);
        assert_eq!(c.min_evidence_chars, 400);
        assert_eq!((c.plan_history_turns, c.synth_history_turns), (6, 10));
        assert_eq!(c.clone().sanitized(), c);
    }

    #[test]
    fn sanitized_clamps_out_of_range_values() {
        let c = PipelineConfig {
            concurrency: 64,
            filter_cap: 50,
            urls_per_query: 0,
            ..PipelineConfig::default()
        }
        .sanitized();
        assert_eq!(c.concurrency, 5);
        assert_eq!(c.filter_cap, MAX_FILTER_CAP);
        assert_eq!(c.urls_per_query, 1);
    }

    #[test]
    fn invalid_numbers_are_reported_with_their_key() {
        let e: Result<Option<usize>, _> = {
            std::env::set_var("ASKPIPE_TEST_BAD_NUMBER", "many");
            let r = env_parse("ASKPIPE_TEST_BAD_NUMBER");
            std::env::remove_var("ASKPIPE_TEST_BAD_NUMBER");
            r
        };
        assert_eq!(
            e,
            Err(ConfigError::Invalid {
                key: "ASKPIPE_TEST_BAD_NUMBER",
                value: "many".to_string()
            })
        );
    }
}
