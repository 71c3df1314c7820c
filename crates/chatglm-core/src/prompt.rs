//! Multi-turn prompt rendering.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One completed question/answer exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub question: String,
    pub answer: String,
}

impl Turn {
    pub fn new(question: impl Into<String>, answer: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            answer: answer.into(),
        }
    }
}

/// Renders `history` (oldest first) plus `query` in the engine's round
/// format:
///
/// ```text
/// [Round 0]
///
/// 问：{question}
///
/// 答：{answer}
///
/// [Round N]
///
/// 问：{query}
///
/// 答：
/// ```
#[derive(Debug, Clone, Copy)]
pub struct PromptBuilder<'a> {
    query: &'a str,
    history: &'a [Turn],
}

impl<'a> PromptBuilder<'a> {
    pub fn new(query: &'a str, history: &'a [Turn]) -> Self {
        Self { query, history }
    }

    pub fn build(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for PromptBuilder<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (round, turn) in self.history.iter().enumerate() {
            write!(
                f,
                "[Round {round}]\n\n问：{}\n\n答：{}\n\n",
                turn.question, turn.answer
            )?;
        }
        write!(
            f,
            "[Round {}]\n\n问：{}\n\n答：",
            self.history.len(),
            self.query
        )
    }
}

/// Render a prompt for `query` after `history`.
pub fn build_prompt(query: &str, history: &[Turn]) -> String {
    PromptBuilder::new(query, history).build()
}

/// Accumulated dialogue for interactive use.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    turns: Vec<Turn>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_turns(turns: Vec<Turn>) -> Self {
        Self { turns }
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Prompt asking `query` as the next round.
    pub fn prompt_for(&self, query: &str) -> String {
        build_prompt(query, &self.turns)
    }

    pub fn record(&mut self, question: impl Into<String>, answer: impl Into<String>) {
        self.turns.push(Turn::new(question, answer));
    }

    pub fn clear(&mut self) {
        self.turns.clear();
    }
}
