//! Feedback question parsing.
//!
//! After a passing submission the server may ask feedback questions whose
//! kind is a small string DSL. Only `text` and `intrange[L..U]` are
//! understood. Anything else is dropped with a warning; a bad question must
//! never abort the submission flow.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::remote::RawFeedbackQuestion;

static INT_RANGE: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"^intrange\[(-?[0-9]+)\.\.(-?[0-9]+)\]$").ok());

/// Typed kind of a feedback question.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FeedbackKind {
    /// Free text answer.
    Text,
    /// Integer answer in the inclusive range `lower..=upper`.
    #[serde(rename = "intrange")]
    IntRange {
        /// Smallest accepted value.
        lower: i64,
        /// Largest accepted value.
        upper: i64,
    },
}

/// A feedback question with a parsed kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackQuestion {
    /// Question id.
    pub id: u64,
    /// Question text.
    pub question: String,
    /// Parsed kind.
    #[serde(flatten)]
    pub kind: FeedbackKind,
}

/// Parses a kind string.
///
/// The whole string must match: `intrange[1..2]extra` is rejected.
#[must_use]
pub fn parse_kind(kind: &str) -> Option<FeedbackKind> {
    if kind == "text" {
        return Some(FeedbackKind::Text);
    }
    let captures = INT_RANGE.as_ref()?.captures(kind)?;
    let lower = captures.get(1)?.as_str().parse().ok()?;
    let upper = captures.get(2)?.as_str().parse().ok()?;
    Some(FeedbackKind::IntRange { lower, upper })
}

/// Parses every question, dropping the ones with an unknown kind.
#[must_use]
pub fn parse_questions(questions: &[RawFeedbackQuestion]) -> Vec<FeedbackQuestion> {
    questions
        .iter()
        .filter_map(|q| match parse_kind(&q.kind) {
            Some(kind) => Some(FeedbackQuestion {
                id: q.id,
                question: q.question.clone(),
                kind,
            }),
            None => {
                warn!(question_id = q.id, kind = %q.kind, "Unexpected feedback question type");
                None
            }
        })
        .collect()
}

impl FeedbackKind {
    /// Returns `true` if `answer` is acceptable for this kind.
    #[must_use]
    pub fn accepts(&self, answer: &str) -> bool {
        match self {
            Self::Text => true,
            Self::IntRange { lower, upper } => answer
                .trim()
                .parse::<i64>()
                .is_ok_and(|n| (*lower..=*upper).contains(&n)),
        }
    }
}
