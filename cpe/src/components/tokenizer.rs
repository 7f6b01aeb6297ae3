use crate::cas::{Annotation, Cas, ProcessingResourceMetaData, TypeDescription, ANNOTATION_TYPE};
use crate::error::{ConfigurationError, ProcessingError};
use crate::processor::CasProcessor;

use super::ComponentParams;

/// Registry name of [`WhitespaceTokenizer`].
pub const WHITESPACE_TOKENIZER: &str = "whitespace_tokenizer";

/// Annotation type produced by the tokenizer.
pub const TOKEN_TYPE: &str = "cpe.Token";

/// Splits the document text on whitespace into `cpe.Token` annotations.
///
/// Each token carries a `normalized` feature, lowercased unless the
/// `lowercase` parameter is `false`.
#[derive(Debug, Clone)]
pub struct WhitespaceTokenizer {
    lowercase: bool,
}

impl Default for WhitespaceTokenizer {
    fn default() -> Self {
        Self { lowercase: true }
    }
}

impl WhitespaceTokenizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_params(params: &ComponentParams) -> Result<Self, ConfigurationError> {
        Ok(Self {
            lowercase: params.parse("lowercase")?.unwrap_or(true),
        })
    }

    fn normalize(&self, token: &str) -> String {
        let trimmed = token.trim_matches(|c: char| c.is_ascii_punctuation());
        let token = if trimmed.is_empty() { token } else { trimmed };
        if self.lowercase {
            token.to_lowercase()
        } else {
            token.to_string()
        }
    }
}

impl CasProcessor for WhitespaceTokenizer {
    fn process(&mut self, cas: &mut Cas) -> Result<(), ProcessingError> {
        let text = cas.document_text().to_string();
        let mut start = None;

        for (i, c) in text.char_indices() {
            match (c.is_whitespace(), start) {
                (false, None) => start = Some(i),
                (true, Some(begin)) => {
                    let token = Annotation::new(TOKEN_TYPE, begin, i)
                        .with_feature("normalized", self.normalize(&text[begin..i]));
                    cas.add_annotation(token);
                    start = None;
                }
                _ => {}
            }
        }
        if let Some(begin) = start {
            let token = Annotation::new(TOKEN_TYPE, begin, text.len())
                .with_feature("normalized", self.normalize(&text[begin..]));
            cas.add_annotation(token);
        }
        Ok(())
    }

    fn metadata(&self) -> ProcessingResourceMetaData {
        ProcessingResourceMetaData::named(WHITESPACE_TOKENIZER).with_type(
            TypeDescription::new(TOKEN_TYPE, ANNOTATION_TYPE).with_feature("normalized", "uima.cas.String"),
        )
    }
}
