//! Task-conditional quality scoring of generated text.
//!
//! Each task category gets its own score shape, so a code run can
//! never carry a lexical-diversity score and vice versa:
//! - qa/summary: a semantic score delegated to an external
//!   BARTScore-style service (absent service or failed call -> `None`),
//! - code: structural checks on the extracted fenced block,
//! - creative: distinct-n lexical diversity over whitespace tokens.

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::record::TaskKind;

/// Transport timeout for scoring-service calls.
const SCORER_TIMEOUT_SECS: u64 = 60;

// ============================================================================
// Score type
// ============================================================================

/// Quality assessment of one run, keyed by task category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QualityScore {
    /// qa/summary: reference-based semantic similarity
    Semantic { bartscore: Option<f64> },
    /// code: structural checks on the extracted snippet
    Code {
        compiles: bool,
        has_expected_pattern: bool,
        mentions_complexity: bool,
    },
    /// creative: lexical diversity
    Creative {
        distinct_1: f64,
        distinct_2: f64,
        distinct_3: f64,
        length_tokens: usize,
    },
}

impl QualityScore {
    /// Semantic score when this is a semantic assessment, else `None`.
    #[must_use]
    pub fn semantic_score(&self) -> Option<f64> {
        match self {
            Self::Semantic { bartscore } => *bartscore,
            _ => None,
        }
    }

    /// Single comparable quality value used by the analyzer: compile
    /// success for code, distinct-2 for creative, the semantic score
    /// for the rest.
    #[must_use]
    pub fn unified(&self) -> Option<f64> {
        match self {
            Self::Semantic { bartscore } => *bartscore,
            Self::Code { compiles, .. } => Some(if *compiles { 1.0 } else { 0.0 }),
            Self::Creative { distinct_2, .. } => Some(*distinct_2),
        }
    }
}

/// Score `output` for `task`, using `scorer` for semantic tasks when
/// available.
#[must_use]
pub fn score_output(
    task: TaskKind,
    output: &str,
    reference: Option<&str>,
    scorer: Option<&SemanticScorer>,
) -> QualityScore {
    match task {
        TaskKind::Qa | TaskKind::Summary => {
            let bartscore = match (scorer, reference) {
                (Some(s), Some(r)) => s.score(r, output),
                _ => None,
            };
            QualityScore::Semantic { bartscore }
        }
        TaskKind::Code => {
            let block = extract_code_block(output);
            let code = block.as_deref().unwrap_or("");
            QualityScore::Code {
                compiles: compiles_structurally(code),
                has_expected_pattern: code.contains("binary_search") || output.contains("二分"),
                mentions_complexity: mentions_complexity(output),
            }
        }
        TaskKind::Creative => {
            let tokens: Vec<&str> = output.split_whitespace().collect();
            QualityScore::Creative {
                distinct_1: distinct_n(&tokens, 1),
                distinct_2: distinct_n(&tokens, 2),
                distinct_3: distinct_n(&tokens, 3),
                length_tokens: tokens.len(),
            }
        }
    }
}

// ============================================================================
// Lexical diversity
// ============================================================================

/// Unique n-grams over total n-grams; 0.0 when the text has no n-gram
/// of that order.
#[must_use]
pub fn distinct_n(tokens: &[&str], n: usize) -> f64 {
    if n == 0 || tokens.len() < n {
        return 0.0;
    }
    let total = tokens.len() - n + 1;
    let unique: HashSet<&[&str]> = tokens.windows(n).collect();
    unique.len() as f64 / total as f64
}

// ============================================================================
// Code checks
// ============================================================================

/// First fenced code block in `text`, preferring a `python`-tagged
/// fence over an untagged one.
#[must_use]
pub fn extract_code_block(text: &str) -> Option<String> {
    extract_fence(text, "```python").or_else(|| extract_fence(text, "```"))
}

fn extract_fence(text: &str, opener: &str) -> Option<String> {
    let start = text.find(opener)? + opener.len();
    let rest = &text[start..];
    // Skip the remainder of the opener line (language tag and newline).
    let body_start = rest.find('\n').map(|i| i + 1)?;
    let body = &rest[body_start..];
    let end = body.find("```")?;
    let code = body[..end].trim();
    if code.is_empty() {
        None
    } else {
        Some(code.to_string())
    }
}

/// Structural stand-in for a real parse: the snippet is non-empty,
/// contains a function definition, and its brackets balance.
#[must_use]
pub fn compiles_structurally(code: &str) -> bool {
    let code = code.trim();
    if code.is_empty() || !code.contains("def ") {
        return false;
    }
    balanced_delimiters(code)
}

fn balanced_delimiters(code: &str) -> bool {
    let mut stack = Vec::new();
    let mut in_string: Option<char> = None;
    for ch in code.chars() {
        if let Some(quote) = in_string {
            if ch == quote {
                in_string = None;
            }
            continue;
        }
        match ch {
            '\'' | '"' => in_string = Some(ch),
            '(' | '[' | '{' => stack.push(ch),
            ')' => {
                if stack.pop() != Some('(') {
                    return false;
                }
            }
            ']' => {
                if stack.pop() != Some('[') {
                    return false;
                }
            }
            '}' => {
                if stack.pop() != Some('{') {
                    return false;
                }
            }
            _ => {}
        }
    }
    stack.is_empty()
}

fn mentions_complexity(text: &str) -> bool {
    let lower = text.to_lowercase();
    lower.contains("o(log")
        || lower.contains("log n")
        || lower.contains("logn")
        || text.contains("时间复杂度")
}

// ============================================================================
// Semantic scoring service
// ============================================================================

#[derive(Serialize)]
struct ScoreRequest<'a> {
    reference: &'a str,
    hypothesis: &'a str,
}

#[derive(Deserialize)]
struct ScoreResponse {
    score: f64,
}

/// Client for an external BARTScore-style scoring endpoint. Every
/// failure mode degrades to `None`; scoring never fails a run.
pub struct SemanticScorer {
    url: String,
    client: reqwest::blocking::Client,
}

impl SemanticScorer {
    /// Build a scorer for `url`, or `None` when the client cannot be
    /// constructed.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Option<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(SCORER_TIMEOUT_SECS))
            .build()
            .ok()?;
        Some(Self {
            url: url.into(),
            client,
        })
    }

    /// Score `hypothesis` against `reference`, `None` on any failure.
    #[must_use]
    pub fn score(&self, reference: &str, hypothesis: &str) -> Option<f64> {
        let request = ScoreRequest {
            reference,
            hypothesis,
        };
        let result = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .and_then(|r| r.error_for_status())
            .and_then(|r| r.json::<ScoreResponse>());
        match result {
            Ok(response) => Some(response.score),
            Err(e) => {
                debug!("semantic scoring failed: {e}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distinct_n_all_unique() {
        let tokens = ["a", "b", "c", "d"];
        assert_eq!(distinct_n(&tokens, 1), 1.0);
        assert_eq!(distinct_n(&tokens, 2), 1.0);
    }

    #[test]
    fn test_distinct_n_repetition() {
        let tokens = ["a", "a", "a", "a"];
        assert_eq!(distinct_n(&tokens, 1), 0.25);
        // Three bigrams, all "a a".
        assert!((distinct_n(&tokens, 2) - 1.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_distinct_n_short_input() {
        let tokens = ["solo"];
        assert_eq!(distinct_n(&tokens, 2), 0.0);
        assert_eq!(distinct_n(&[], 1), 0.0);
    }

    #[test]
    fn test_extract_prefers_python_fence() {
        let text = "intro\n```\nplain\n```\nthen\n```python\ndef f():\n    pass\n```\n";
        let code = extract_code_block(text).unwrap();
        assert!(code.contains("def f()"));
    }

    #[test]
    fn test_extract_falls_back_to_any_fence() {
        let text = "```\ndef g():\n    return 1\n```";
        let code = extract_code_block(text).unwrap();
        assert!(code.contains("def g()"));
    }

    #[test]
    fn test_extract_none_without_fence() {
        assert!(extract_code_block("no code here").is_none());
        assert!(extract_code_block("```python\n\n```").is_none());
    }

    #[test]
    fn test_compiles_structurally() {
        assert!(compiles_structurally(
            "def binary_search(arr, x):\n    lo, hi = 0, len(arr) - 1\n    return -1"
        ));
        assert!(!compiles_structurally("x = 1"));
        assert!(!compiles_structurally(""));
        assert!(!compiles_structurally("def broken(:\n    return ]"));
    }

    #[test]
    fn test_balanced_ignores_string_contents() {
        assert!(compiles_structurally("def f():\n    return \"(unclosed\""));
    }

    #[test]
    fn test_code_score_pattern_and_complexity() {
        let output =
            "这是二分查找：\n```python\ndef binary_search(a, x):\n    return 0\n```\n时间复杂度为 O(log n)。";
        let score = score_output(TaskKind::Code, output, None, None);
        match score {
            QualityScore::Code {
                compiles,
                has_expected_pattern,
                mentions_complexity,
            } => {
                assert!(compiles);
                assert!(has_expected_pattern);
                assert!(mentions_complexity);
            }
            _ => panic!("expected a code score"),
        }
    }

    #[test]
    fn test_semantic_without_scorer_is_none() {
        let score = score_output(TaskKind::Qa, "answer", Some("reference"), None);
        assert_eq!(score, QualityScore::Semantic { bartscore: None });
        assert_eq!(score.semantic_score(), None);
    }

    #[test]
    fn test_unified_values() {
        assert_eq!(
            QualityScore::Code {
                compiles: true,
                has_expected_pattern: false,
                mentions_complexity: false
            }
            .unified(),
            Some(1.0)
        );
        assert_eq!(
            QualityScore::Creative {
                distinct_1: 0.9,
                distinct_2: 0.8,
                distinct_3: 0.7,
                length_tokens: 10
            }
            .unified(),
            Some(0.8)
        );
        assert_eq!(
            QualityScore::Semantic { bartscore: None }.unified(),
            None
        );
    }

    #[test]
    fn test_score_serde_tagging() {
        let score = QualityScore::Semantic {
            bartscore: Some(-2.5),
        };
        let json = serde_json::to_value(&score).unwrap();
        assert_eq!(json["kind"], "semantic");
        let back: QualityScore = serde_json::from_value(json).unwrap();
        assert_eq!(back, score);
    }
}
