use std::collections::HashSet;
use tracing::info;

use crate::cas::{Cas, ProcessingResourceMetaData};
use crate::error::ProcessingError;
use crate::processor::CasProcessor;

use super::tokenizer::TOKEN_TYPE;

/// Registry name of [`TokenStatistics`].
pub const TOKEN_STATISTICS: &str = "token_statistics";

/// CAS metadata key holding the entity's token count.
pub const TOKEN_COUNT_KEY: &str = "token_count";

/// CAS metadata key holding the entity's distinct normalized tokens.
pub const DISTINCT_TOKENS_KEY: &str = "distinct_tokens";

/// Records per-entity token counts as CAS metadata and keeps running totals.
///
/// Stateful: totals accumulate per instance and are logged at end of batch
/// and end of collection.
#[derive(Debug, Default)]
pub struct TokenStatistics {
    entities: u64,
    tokens: u64,
}

impl TokenStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn totals(&self) -> (u64, u64) {
        (self.entities, self.tokens)
    }
}

impl CasProcessor for TokenStatistics {
    fn process(&mut self, cas: &mut Cas) -> Result<(), ProcessingError> {
        let mut count = 0u64;
        let mut distinct = HashSet::new();
        for token in cas.select(TOKEN_TYPE) {
            count += 1;
            let key = match token.features.get("normalized").and_then(|v| v.as_str()) {
                Some(normalized) => normalized.to_string(),
                None => token
                    .covered_text(cas.document_text())
                    .unwrap_or_default()
                    .to_string(),
            };
            distinct.insert(key);
        }

        cas.set_metadata(TOKEN_COUNT_KEY, count);
        cas.set_metadata(DISTINCT_TOKENS_KEY, distinct.len() as u64);
        self.entities += 1;
        self.tokens += count;
        Ok(())
    }

    fn is_stateless(&self) -> bool {
        false
    }

    fn metadata(&self) -> ProcessingResourceMetaData {
        ProcessingResourceMetaData::named(TOKEN_STATISTICS)
    }

    fn batch_process_complete(&mut self) -> Result<(), ProcessingError> {
        info!(entities = self.entities, tokens = self.tokens, "Token statistics batch");
        Ok(())
    }

    fn collection_process_complete(&mut self) -> Result<(), ProcessingError> {
        info!(entities = self.entities, tokens = self.tokens, "Token statistics totals");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::WhitespaceTokenizer;

    #[test]
    fn test_counts_tokens() {
        let mut cas = Cas::new();
        cas.set_document_text("to be or not to be");
        WhitespaceTokenizer::new().process(&mut cas).unwrap();

        let mut stats = TokenStatistics::new();
        stats.process(&mut cas).unwrap();

        assert_eq!(cas.metadata(TOKEN_COUNT_KEY), Some(&serde_json::json!(6)));
        assert_eq!(cas.metadata(DISTINCT_TOKENS_KEY), Some(&serde_json::json!(4)));
        assert_eq!(stats.totals(), (1, 6));
        assert!(!stats.is_stateless());
    }

    #[test]
    fn test_untokenized_document() {
        let mut cas = Cas::new();
        cas.set_document_text("no tokens yet");
        let mut stats = TokenStatistics::new();
        stats.process(&mut cas).unwrap();
        assert_eq!(cas.metadata(TOKEN_COUNT_KEY), Some(&serde_json::json!(0)));
    }
}
