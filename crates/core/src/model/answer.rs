use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::model::ids::OptionId;

/// A learner's answer to one question.
///
/// The shape depends on the question type. On the wire the value is untagged:
/// a single option id is a JSON number, a multi-select is an array of numbers,
/// free text is a string and true/false questions are a boolean.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AnswerValue {
    Choice(OptionId),
    Choices(BTreeSet<OptionId>),
    Text(String),
    Bool(bool),
}

impl AnswerValue {
    #[must_use]
    pub fn choices<I>(ids: I) -> Self
    where
        I: IntoIterator<Item = u64>,
    {
        Self::Choices(ids.into_iter().map(OptionId::new).collect())
    }

    #[must_use]
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    /// Returns true when the value carries no answer at all.
    ///
    /// Blank text and an empty selection count as "no answer".
    #[must_use]
    pub fn is_blank(&self) -> bool {
        match self {
            AnswerValue::Choice(_) | AnswerValue::Bool(_) => false,
            AnswerValue::Choices(ids) => ids.is_empty(),
            AnswerValue::Text(text) => text.trim().is_empty(),
        }
    }
}
