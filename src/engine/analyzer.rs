use std::collections::HashMap;

/// Term frequencies of one analyzed document
pub type TermFrequencies = HashMap<String, u32>;

/// Turns document content into indexable terms.
pub trait Analyzer: Send + Sync {
    fn term_frequencies(&self, content: &str) -> TermFrequencies;
}

/// Splits on non-alphanumeric boundaries and lowercases.
#[derive(Clone, Copy, Debug, Default)]
pub struct SimpleAnalyzer;

impl Analyzer for SimpleAnalyzer {
    fn term_frequencies(&self, content: &str) -> TermFrequencies {
        let mut freqs = HashMap::new();
        for token in content.split(|c: char| !c.is_alphanumeric()) {
            if token.is_empty() {
                continue;
            }
            *freqs.entry(token.to_lowercase()).or_insert(0) += 1;
        }
        freqs
    }
}
