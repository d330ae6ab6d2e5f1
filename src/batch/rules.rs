//! 无可用凭证时的本地关键词判定。

use crate::batch::types::{TaskParams, WorkItem};

/// 从自由文本标准里抽取关键词时最多保留的数量。
const MAX_DERIVED_KEYWORDS: usize = 20;

const STOPWORDS: &[&str] = &[
    "about", "after", "also", "among", "and", "are", "based", "been", "being", "between", "both",
    "from", "have", "into", "more", "must", "only", "other", "over", "paper", "papers", "should",
    "some", "studies", "study", "such", "than", "that", "their", "them", "then", "there", "these",
    "they", "this", "those", "through", "under", "using", "were", "what", "when", "where", "which",
    "while", "with", "within", "without", "would",
];

#[derive(Debug, Clone, PartialEq)]
pub struct RuleDecision {
    pub included: bool,
    pub reasoning: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, Default)]
pub struct KeywordRules {
    include: Vec<String>,
    exclude: Vec<String>,
}

impl KeywordRules {
    /// 优先使用显式关键词；没有时从纳入/排除标准的文字里抽取。
    pub fn from_params(params: &TaskParams) -> Self {
        let include = if params.inclusion_keywords.is_empty() {
            derive_keywords(&params.inclusion_criteria)
        } else {
            normalize(&params.inclusion_keywords)
        };
        let exclude = if params.exclusion_keywords.is_empty() {
            derive_keywords(&params.exclusion_criteria)
        } else {
            normalize(&params.exclusion_keywords)
        };
        Self { include, exclude }
    }

    pub fn decide(&self, item: &WorkItem) -> RuleDecision {
        let haystack = format!(
            "{} {} {}",
            item.title,
            item.abstract_text,
            item.keywords.join(" ")
        )
        .to_lowercase();

        let hits = |words: &[String]| -> Vec<String> {
            words
                .iter()
                .filter(|w| haystack.contains(w.as_str()))
                .cloned()
                .collect()
        };
        let inc = hits(&self.include);
        let exc = hits(&self.exclude);

        if !exc.is_empty() {
            return RuleDecision {
                included: false,
                reasoning: format!(
                    "Rule-based fallback: matched exclusion keywords [{}]",
                    exc.join(", ")
                ),
                confidence: (0.45 + 0.05 * exc.len() as f64).min(0.6),
            };
        }
        if self.include.is_empty() {
            return RuleDecision {
                included: true,
                reasoning: "Rule-based fallback: no inclusion keywords configured and no exclusion keyword matched".to_string(),
                confidence: 0.3,
            };
        }
        if inc.is_empty() {
            return RuleDecision {
                included: false,
                reasoning: "Rule-based fallback: no inclusion keyword matched".to_string(),
                confidence: 0.3,
            };
        }
        RuleDecision {
            included: true,
            reasoning: format!(
                "Rule-based fallback: matched inclusion keywords [{}]",
                inc.join(", ")
            ),
            confidence: (0.35 + 0.05 * inc.len() as f64).min(0.6),
        }
    }
}

fn normalize(words: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for w in words {
        let w = w.trim().to_lowercase();
        if !w.is_empty() && !out.contains(&w) {
            out.push(w);
        }
    }
    out
}

fn derive_keywords(text: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for word in text
        .split(|c: char| !c.is_alphanumeric() && c != '-')
        .map(|w| w.trim_matches('-').to_lowercase())
    {
        if word.chars().count() < 4 || STOPWORDS.contains(&word.as_str()) || out.contains(&word) {
            continue;
        }
        out.push(word);
        if out.len() >= MAX_DERIVED_KEYWORDS {
            break;
        }
    }
    out
}
