//! ConversationHistory: append-only, provider-neutral message history.
//!
//! One history per engine (per session). Tool traffic is appended a round at
//! a time, so a tool-result turn always directly follows the assistant turn
//! that requested those tools.

use crate::inference::types::ToolRequest;

use super::types::{ContentBlock, ConversationTurn, Role, ToolOutcome, TurnContent};

// ─── ConversationHistory ────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct ConversationHistory {
    turns: Vec<ConversationTurn>,
}

impl ConversationHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn turns(&self) -> &[ConversationTurn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn last(&self) -> Option<&ConversationTurn> {
        self.turns.last()
    }

    // ─── Appends ────────────────────────────────────────────────────────

    pub fn push_user(&mut self, text: impl Into<String>) {
        self.turns.push(ConversationTurn::user_text(text));
    }

    pub fn push_assistant(&mut self, text: impl Into<String>) {
        self.turns.push(ConversationTurn::assistant_text(text));
    }

    /// Append one tool round: the assistant turn carrying the requests
    /// (preceded by any text the model emitted), then the synthetic user turn
    /// carrying one result per request, in request order.
    pub fn push_tool_round(
        &mut self,
        text: &str,
        requests: &[ToolRequest],
        outcomes: &[ToolOutcome],
    ) {
        debug_assert_eq!(requests.len(), outcomes.len());

        let mut blocks = Vec::with_capacity(requests.len() + 1);
        if !text.is_empty() {
            blocks.push(ContentBlock::Text {
                text: text.to_string(),
            });
        }
        blocks.extend(requests.iter().map(|r| ContentBlock::ToolRequest {
            id: r.id.clone(),
            name: r.name.clone(),
            arguments: r.arguments.clone(),
        }));

        let results = requests
            .iter()
            .zip(outcomes)
            .map(|(r, outcome)| ContentBlock::ToolResult {
                request_id: r.id.clone(),
                outcome: outcome.clone(),
            })
            .collect();

        self.turns.push(ConversationTurn {
            role: Role::Assistant,
            content: TurnContent::Blocks(blocks),
        });
        self.turns.push(ConversationTurn {
            role: Role::User,
            content: TurnContent::Blocks(results),
        });
    }

    /// Whether every tool-result turn answers exactly the requests of the
    /// assistant turn right before it.
    pub fn is_well_formed(&self) -> bool {
        self.turns.iter().enumerate().all(|(i, turn)| {
            let answered = turn.tool_result_ids();
            if answered.is_empty() {
                return true;
            }
            match i.checked_sub(1).map(|p| &self.turns[p]) {
                Some(prev) => prev.role == Role::Assistant && prev.tool_request_ids() == answered,
                None => false,
            }
        })
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
