//! Bounded prompt assembly and citation parsing.
//!
//! A prompt is a list of role-tagged messages: one system message carrying
//! the instructions and retrieved passages, the recent history turns, and
//! the new user question. When the total size exceeds the budget, content
//! is dropped in a fixed order:
//!
//! 1. the oldest history turn, repeatedly, until history is empty;
//! 2. then the lowest-similarity passage, repeatedly.
//!
//! The user question is never shortened. A question that alone exceeds the
//! budget is sent as is.
//!
//! Passages are labelled `[C<chunk_index>]`. [`parse_citations`] maps those
//! markers in the model's reply back to the passages that were sent.

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;

use crate::models::{Citation, ScoredChunk, Turn};

/// Characters of chunk text kept in a citation snippet.
pub const SNIPPET_CHARS: usize = 200;

const INSTRUCTIONS: &str = "You answer questions about a document the user uploaded. \
Use only the numbered passages below as evidence. \
Cite every passage you rely on with its marker, for example [C3]. \
If the passages do not contain the answer, say so plainly.";

const NO_CONTEXT: &str = "No relevant context was found in the document for this question.";

const NO_DOCUMENT: &str = "No document is attached to this conversation. \
Answer from the conversation so far and say when you cannot.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptRole {
    System,
    User,
    Assistant,
}

impl PromptRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            PromptRole::System => "system",
            PromptRole::User => "user",
            PromptRole::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PromptMessage {
    pub role: PromptRole,
    pub content: String,
}

/// Everything that may go into one prompt.
#[derive(Debug, Clone, Copy)]
pub struct PromptInput<'a> {
    /// Retrieved passages, best first.
    pub chunks: &'a [ScoredChunk],
    /// Recent turns, oldest first.
    pub history: &'a [Turn],
    pub question: &'a str,
    /// Whether the chat is scoped to a document at all.
    pub has_document: bool,
}

/// A prompt that fits the budget, plus what was kept to build it.
#[derive(Debug, Clone)]
pub struct AssembledPrompt {
    pub messages: Vec<PromptMessage>,
    /// Passages actually sent, best first.
    pub included: Vec<ScoredChunk>,
    pub dropped_turns: usize,
    pub dropped_chunks: usize,
}

impl AssembledPrompt {
    /// Total characters across all messages.
    pub fn size(&self) -> usize {
        self.messages.iter().map(|m| m.content.chars().count()).sum()
    }
}

/// Build a prompt of at most `budget_chars` characters where possible.
pub fn assemble(input: PromptInput<'_>, budget_chars: usize) -> AssembledPrompt {
    let mut history: Vec<&Turn> = input.history.iter().collect();
    let mut chunks: Vec<ScoredChunk> = input.chunks.to_vec();
    let mut dropped_turns = 0;
    let mut dropped_chunks = 0;

    loop {
        let messages = render(&chunks, &history, input.question, input.has_document);
        let size: usize = messages.iter().map(|m| m.content.chars().count()).sum();
        if size <= budget_chars {
            return AssembledPrompt {
                messages,
                included: chunks,
                dropped_turns,
                dropped_chunks,
            };
        }
        if !history.is_empty() {
            history.remove(0);
            dropped_turns += 1;
        } else if let Some(weakest) = weakest_chunk(&chunks) {
            chunks.remove(weakest);
            dropped_chunks += 1;
        } else {
            return AssembledPrompt {
                messages,
                included: chunks,
                dropped_turns,
                dropped_chunks,
            };
        }
    }
}

/// Position of the lowest-similarity chunk; among equals, the one ranked last.
fn weakest_chunk(chunks: &[ScoredChunk]) -> Option<usize> {
    chunks
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| {
            a.similarity
                .total_cmp(&b.similarity)
                .then(b.chunk_index.cmp(&a.chunk_index))
        })
        .map(|(i, _)| i)
}

fn render(
    chunks: &[ScoredChunk],
    history: &[&Turn],
    question: &str,
    has_document: bool,
) -> Vec<PromptMessage> {
    let mut system = String::from(INSTRUCTIONS);
    system.push_str("\n\n");
    if !has_document {
        system.push_str(NO_DOCUMENT);
    } else if chunks.is_empty() {
        system.push_str(NO_CONTEXT);
    } else {
        system.push_str("Passages:\n");
        for c in chunks {
            system.push_str(&format!("\n[C{}] (page {}", c.chunk_index, c.page));
            if let Some(section) = &c.section {
                system.push_str(&format!(", section \"{}\"", section));
            }
            system.push_str(")\n");
            system.push_str(&c.text);
            system.push('\n');
        }
    }

    let mut messages = Vec::with_capacity(2 + history.len() * 2);
    messages.push(PromptMessage {
        role: PromptRole::System,
        content: system,
    });
    for turn in history {
        messages.push(PromptMessage {
            role: PromptRole::User,
            content: turn.user.content.clone(),
        });
        messages.push(PromptMessage {
            role: PromptRole::Assistant,
            content: turn.assistant.content.clone(),
        });
    }
    messages.push(PromptMessage {
        role: PromptRole::User,
        content: question.to_string(),
    });
    messages
}

fn marker_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\[C(\d+)\]").expect("citation marker pattern is valid"))
}

/// Turn `[C<n>]` markers in `answer` into citations for the passages sent.
///
/// Markers are taken in order of first appearance; markers naming a
/// passage that was not sent are ignored. If the answer cites nothing
/// recognisable, every sent passage is returned.
pub fn parse_citations(answer: &str, included: &[ScoredChunk]) -> Vec<Citation> {
    let mut seen = HashSet::new();
    let cited: Vec<Citation> = marker_pattern()
        .captures_iter(answer)
        .filter_map(|cap| cap.get(1)?.as_str().parse::<i64>().ok())
        .filter(|idx| seen.insert(*idx))
        .filter_map(|idx| included.iter().find(|c| c.chunk_index == idx))
        .map(citation_for)
        .collect();

    if cited.is_empty() {
        included.iter().map(citation_for).collect()
    } else {
        cited
    }
}

pub fn citation_for(chunk: &ScoredChunk) -> Citation {
    Citation {
        chunk_id: chunk.chunk_id.clone(),
        page: chunk.page,
        chunk_index: chunk.chunk_index,
        snippet: snippet(&chunk.text),
        similarity: chunk.similarity,
    }
}

/// First [`SNIPPET_CHARS`] characters of `text` on one line.
pub fn snippet(text: &str) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= SNIPPET_CHARS {
        return flat;
    }
    let mut cut: String = flat.chars().take(SNIPPET_CHARS).collect();
    if let Some(space) = cut.rfind(' ') {
        cut.truncate(space);
    }
    cut.push('…');
    cut
}
