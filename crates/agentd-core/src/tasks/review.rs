//! Review agent
//!
//! Evaluates a task result against declarative criteria through the LLM
//! backend and returns an accept/reject verdict. A failed or unparseable
//! review counts as accept so a broken reviewer cannot trap a task in the
//! retry loop.

use std::sync::Arc;

use chrono::NaiveDate;
use tracing::{info, warn};

use crate::llm::{LlmBackend, LlmRequest};

/// Longest result excerpt shown to the reviewer
const REVIEW_RESULT_CHARS: usize = 8000;

/// Outcome of a review evaluation
#[derive(Debug, Clone, PartialEq)]
pub enum ReviewVerdict {
    Accept {
        feedback: String,
    },
    Reject {
        feedback: String,
        /// Directions worth exploring in the next attempt
        suggestions: Vec<String>,
        /// Aspects the result failed to cover
        missing_dimensions: Vec<String>,
    },
}

impl ReviewVerdict {
    pub fn is_accept(&self) -> bool {
        matches!(self, ReviewVerdict::Accept { .. })
    }
}

/// Evaluates task results against quality criteria
#[derive(Clone)]
pub struct ReviewAgent {
    backend: Arc<dyn LlmBackend>,
}

impl ReviewAgent {
    pub fn new(backend: Arc<dyn LlmBackend>) -> Self {
        Self { backend }
    }

    /// Judge one attempt's result against the criteria
    pub async fn evaluate(
        &self,
        description: &str,
        result: &str,
        criteria: &str,
        attempt: u32,
        current_date: NaiveDate,
    ) -> ReviewVerdict {
        let prompt = build_review_prompt(description, result, criteria, attempt, current_date);
        let request = LlmRequest::new(prompt);

        match self.backend.invoke(request).await {
            Ok(reply) => {
                let verdict = parse_verdict(&reply.text);
                info!(
                    attempt,
                    accepted = verdict.is_accept(),
                    "review verdict"
                );
                verdict
            }
            Err(e) => {
                warn!(attempt, "review call failed, accepting result: {}", e);
                ReviewVerdict::Accept {
                    feedback: format!("review unavailable: {}", e),
                }
            }
        }
    }
}

fn build_review_prompt(
    description: &str,
    result: &str,
    criteria: &str,
    attempt: u32,
    current_date: NaiveDate,
) -> String {
    let excerpt: String = if result.chars().count() > REVIEW_RESULT_CHARS {
        let mut text: String = result.chars().take(REVIEW_RESULT_CHARS).collect();
        text.push_str("\n\n...[truncated]");
        text
    } else {
        result.to_string()
    };

    format!(
        "You are a task quality reviewer. Today is {}.\n\n\
         ## Task\n{}\n\n\
         ## Quality criteria\n{}\n\n\
         ## Result (attempt {})\n{}\n\n\
         Judge the result strictly against the criteria.\n\
         Reply in exactly this format:\n\
         VERDICT: PASS or REJECT\n\
         FEEDBACK: one paragraph explaining the verdict\n\
         SUGGESTIONS: (only on REJECT) one direction per line, prefixed with '- '\n\
         MISSING: (only on REJECT) one missing aspect per line, prefixed with '- '",
        current_date, description, criteria, attempt, excerpt
    )
}

/// Parse the structured verdict; anything unclear passes
fn parse_verdict(text: &str) -> ReviewVerdict {
    let rejected = text.contains("VERDICT: REJECT") || text.contains("VERDICT:REJECT");
    let passed = text.contains("VERDICT: PASS") || text.contains("VERDICT:PASS");

    if !rejected && !passed {
        warn!("unclear review response, accepting by default");
        return ReviewVerdict::Accept {
            feedback: "review verdict unclear, accepted by default".to_string(),
        };
    }

    let feedback = extract_section(text, "FEEDBACK:")
        .map(|s| s.lines().next().unwrap_or("").trim().to_string())
        .unwrap_or_default();

    if passed && !rejected {
        return ReviewVerdict::Accept { feedback };
    }

    ReviewVerdict::Reject {
        feedback: if feedback.is_empty() {
            "result did not meet the quality criteria".to_string()
        } else {
            feedback
        },
        suggestions: extract_list(text, "SUGGESTIONS:"),
        missing_dimensions: extract_list(text, "MISSING:"),
    }
}

fn extract_section<'a>(text: &'a str, marker: &str) -> Option<&'a str> {
    text.split_once(marker).map(|(_, rest)| rest)
}

fn extract_list(text: &str, marker: &str) -> Vec<String> {
    let Some(section) = extract_section(text, marker) else {
        return Vec::new();
    };
    let mut items = Vec::new();
    for line in section.lines() {
        let line = line.trim();
        if let Some(item) = line.strip_prefix("- ") {
            items.push(item.trim().to_string());
        } else if !line.is_empty() && !items.is_empty() {
            // A non-list line ends the section
            break;
        }
    }
    items
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pass() {
        let verdict = parse_verdict("VERDICT: PASS\nFEEDBACK: thorough and well sourced");
        match verdict {
            ReviewVerdict::Accept { feedback } => {
                assert_eq!(feedback, "thorough and well sourced")
            }
            other => panic!("unexpected verdict: {:?}", other),
        }
    }

    #[test]
    fn test_parse_reject_with_lists() {
        let text = "VERDICT: REJECT\n\
                    FEEDBACK: misses the competitive angle\n\
                    SUGGESTIONS:\n- compare against rivals\n- add pricing data\n\
                    MISSING:\n- market share numbers";
        match parse_verdict(text) {
            ReviewVerdict::Reject {
                feedback,
                suggestions,
                missing_dimensions,
            } => {
                assert_eq!(feedback, "misses the competitive angle");
                assert_eq!(suggestions.len(), 2);
                assert_eq!(suggestions[1], "add pricing data");
                assert_eq!(missing_dimensions, vec!["market share numbers".to_string()]);
            }
            other => panic!("unexpected verdict: {:?}", other),
        }
    }

    #[test]
    fn test_parse_reject_without_feedback() {
        match parse_verdict("VERDICT:REJECT") {
            ReviewVerdict::Reject { feedback, .. } => {
                assert!(!feedback.is_empty());
            }
            other => panic!("unexpected verdict: {:?}", other),
        }
    }

    #[test]
    fn test_unclear_response_accepts() {
        assert!(parse_verdict("I think it looks fine?").is_accept());
    }

    #[tokio::test]
    async fn test_review_failure_accepts() {
        use crate::llm::{LlmError, LlmReply};
        use async_trait::async_trait;

        struct DownBackend;

        #[async_trait]
        impl LlmBackend for DownBackend {
            async fn invoke(
                &self,
                _request: LlmRequest,
            ) -> std::result::Result<LlmReply, LlmError> {
                Err(LlmError::Transport("down".to_string()))
            }

            async fn summarize(&self, _e: &str) -> std::result::Result<String, LlmError> {
                Err(LlmError::Transport("down".to_string()))
            }
        }

        let agent = ReviewAgent::new(Arc::new(DownBackend));
        let verdict = agent
            .evaluate("task", "result", "criteria", 1, chrono::Utc::now().date_naive())
            .await;
        assert!(verdict.is_accept());
    }
}
