//! Context assembler.
//!
//! Builds the bounded message list a turn sends to the model: pinned
//! messages always survive (system prompts, the first user message that
//! anchors the topic, and the last few turns), everything else competes on
//! an importance score until the token budget runs out. A separate repair
//! pass fixes tool-call ordering artifacts that concurrent writes can leave
//! in the database before the list ever reaches a provider.

use std::collections::{HashMap, HashSet};

use log::{debug, warn};

use crate::aria::error::EngineError;
use crate::aria::types::{ChatMessage, MessageRole};

/// The most recent messages are always pinned.
pub const MIN_RECENT: usize = 4;

/// Approximate token count for a piece of text: one token per four bytes,
/// never zero. Used whenever the gateway's own counter is unavailable,
/// which for this runtime is always — the approximation is deliberate and
/// matches the persistence-side accounting.
pub fn estimate_tokens(content: &str) -> usize {
    content.len().div_ceil(4).max(1)
}

fn message_tokens(message: &ChatMessage) -> usize {
    estimate_tokens(&message.content)
}

/// Importance of a message for inclusion, independent of pinning.
fn importance(message: &ChatMessage, index: usize, total: usize) -> i32 {
    let mut score = match message.role {
        MessageRole::System => 100,
        MessageRole::Tool => 80,
        MessageRole::User => 60,
        MessageRole::Assistant => 40,
        _ => 30,
    };
    if !message.tool_calls.is_empty() || message.tool_call_id.is_some() {
        score += 20;
    }
    if message.content.len() > 200 {
        score += 10;
    }
    // Last quarter by index.
    if total > 0 && index * 4 >= total * 3 {
        score += 15;
    }
    score
}

/// Produce an ordered subset of `messages` fitting `max_tokens − reserve`.
///
/// Pinned messages (system, first user, last [`MIN_RECENT`]) are kept
/// whenever possible; when they alone exceed the budget the prefix of the
/// pinned set that fits is returned (never an empty list). Remaining budget
/// is filled with unpinned messages in descending importance, ties broken
/// by recency, and the final selection is re-sorted into original order.
pub fn assemble(
    messages: &[ChatMessage],
    model: &str,
    max_tokens: usize,
    reserve: usize,
) -> Result<Vec<ChatMessage>, EngineError> {
    if messages.is_empty() {
        return Ok(Vec::new());
    }
    let budget = max_tokens.saturating_sub(reserve);
    if budget == 0 {
        return Err(EngineError::Context(format!(
            "no context budget left (max_tokens={}, reserve={})",
            max_tokens, reserve
        )));
    }

    let total = messages.len();
    let first_user = messages
        .iter()
        .position(|m| m.role == MessageRole::User);

    let mut pinned: HashSet<usize> = HashSet::new();
    for (index, message) in messages.iter().enumerate() {
        if message.role == MessageRole::System {
            pinned.insert(index);
        }
    }
    if let Some(index) = first_user {
        pinned.insert(index);
    }
    for index in total.saturating_sub(MIN_RECENT)..total {
        pinned.insert(index);
    }

    let pinned_tokens: usize = pinned.iter().map(|&i| message_tokens(&messages[i])).sum();

    if pinned_tokens > budget {
        warn!(
            "pinned context alone exceeds budget ({} > {} tokens, model {})",
            pinned_tokens, budget, model
        );
        let mut kept = Vec::new();
        let mut used = 0usize;
        let mut ordered: Vec<usize> = pinned.into_iter().collect();
        ordered.sort_unstable();
        for index in ordered {
            let tokens = message_tokens(&messages[index]);
            kept.push(messages[index].clone());
            used += tokens;
            if used >= budget {
                break;
            }
        }
        return Ok(kept);
    }

    let mut remaining = budget - pinned_tokens;
    let mut selected: Vec<usize> = pinned.iter().copied().collect();

    // Unpinned candidates, best first; recency wins ties.
    let mut candidates: Vec<usize> = (0..total).filter(|i| !pinned.contains(i)).collect();
    candidates.sort_by_key(|&i| (-importance(&messages[i], i, total), std::cmp::Reverse(i)));

    for index in candidates {
        let tokens = message_tokens(&messages[index]);
        if tokens <= remaining {
            remaining -= tokens;
            selected.push(index);
        }
    }

    selected.sort_unstable();
    debug!(
        "assembled context: {}/{} messages, {} tokens of budget {} (model {})",
        selected.len(),
        total,
        budget - remaining,
        budget,
        model
    );
    Ok(selected.into_iter().map(|i| messages[i].clone()).collect())
}

/// Repair tool-call ordering before a list goes to the provider.
///
/// Concurrent persistence can leave three artifacts that providers reject:
/// tool results whose call id no assistant message declares, assistant
/// messages whose declared calls have no results, and results separated
/// from their assistant message. This pass drops orphans, strips unanswered
/// `tool_calls` (dropping the message entirely if it has no content left),
/// and re-attaches each result directly after the assistant message that
/// requested it.
pub fn repair_tool_ordering(messages: Vec<ChatMessage>) -> Vec<ChatMessage> {
    // Tool results by call id, first occurrence wins.
    let mut results: HashMap<String, ChatMessage> = HashMap::new();
    for message in &messages {
        if message.role == MessageRole::Tool {
            if let Some(call_id) = &message.tool_call_id {
                results.entry(call_id.clone()).or_insert_with(|| message.clone());
            }
        }
    }

    let mut repaired = Vec::with_capacity(messages.len());
    let mut emitted_results: HashSet<String> = HashSet::new();

    for message in messages {
        match message.role {
            // Tool messages are emitted only in their assistant's wake.
            MessageRole::Tool => continue,
            MessageRole::Assistant if !message.tool_calls.is_empty() => {
                let mut message = message;
                // Keep only calls that have an answer on file.
                let answered: Vec<_> = message
                    .tool_calls
                    .iter()
                    .filter(|tc| results.contains_key(&tc.id))
                    .cloned()
                    .collect();
                if answered.is_empty() {
                    message.tool_calls.clear();
                    if message.content.trim().is_empty() {
                        continue;
                    }
                    repaired.push(message);
                    continue;
                }
                message.tool_calls = answered;
                let call_ids: Vec<String> =
                    message.tool_calls.iter().map(|tc| tc.id.clone()).collect();
                repaired.push(message);
                for call_id in call_ids {
                    if emitted_results.insert(call_id.clone()) {
                        if let Some(result) = results.get(&call_id) {
                            repaired.push(result.clone());
                        }
                    }
                }
            }
            MessageRole::Assistant if message.content.trim().is_empty() => continue,
            _ => repaired.push(message),
        }
    }

    repaired
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aria::types::ToolCall;
    use uuid::Uuid;

    fn msg(role: MessageRole, content: &str) -> ChatMessage {
        ChatMessage::new(Uuid::nil(), role, content)
    }

    #[test]
    fn token_estimate_floors_at_one() {
        assert_eq!(estimate_tokens(""), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn small_history_passes_through_in_order() {
        let messages = vec![
            msg(MessageRole::System, "You are Aria."),
            msg(MessageRole::User, "hello"),
            msg(MessageRole::Assistant, "hi"),
        ];
        let out = assemble(&messages, "main", 1000, 100).unwrap();
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].role, MessageRole::System);
        assert_eq!(out[2].role, MessageRole::Assistant);
    }

    #[test]
    fn pinned_survive_when_middle_is_cut() {
        let mut messages = vec![
            msg(MessageRole::System, "system prompt"),
            msg(MessageRole::User, "first question anchoring the topic"),
        ];
        for i in 0..40 {
            messages.push(msg(MessageRole::Assistant, &format!("filler answer number {} {}", i, "x".repeat(120))));
        }
        messages.push(msg(MessageRole::User, "latest question"));

        let out = assemble(&messages, "main", 400, 100).unwrap();
        assert!(out.iter().any(|m| m.role == MessageRole::System));
        assert!(out.iter().any(|m| m.content.starts_with("first question")));
        assert!(out.iter().any(|m| m.content == "latest question"));
        // Original ordering is preserved.
        let positions: Vec<_> = out
            .iter()
            .map(|m| messages.iter().position(|o| o.id == m.id).unwrap())
            .collect();
        let mut sorted = positions.clone();
        sorted.sort_unstable();
        assert_eq!(positions, sorted);
    }

    #[test]
    fn oversized_pinned_returns_prefix_never_empty() {
        let messages = vec![
            msg(MessageRole::System, "short system"),
            msg(MessageRole::User, &"long ".repeat(500)),
        ];
        let out = assemble(&messages, "main", 50, 10).unwrap();
        assert!(!out.is_empty());
        assert_eq!(out[0].role, MessageRole::System);
    }

    #[test]
    fn zero_budget_is_a_context_error() {
        let messages = vec![msg(MessageRole::User, "hi")];
        assert!(matches!(
            assemble(&messages, "main", 100, 100),
            Err(EngineError::Context(_))
        ));
    }

    #[test]
    fn orphan_tool_results_are_dropped() {
        let mut orphan = msg(MessageRole::Tool, "{\"data\": 1}");
        orphan.tool_call_id = Some("call_unknown".to_string());
        let out = repair_tool_ordering(vec![msg(MessageRole::User, "hi"), orphan]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].role, MessageRole::User);
    }

    #[test]
    fn unanswered_tool_calls_are_stripped() {
        let mut assistant = msg(MessageRole::Assistant, "let me check");
        assistant.tool_calls = vec![ToolCall {
            id: "call_1".to_string(),
            name: "memory__search".to_string(),
            arguments: "{}".to_string(),
        }];
        let out = repair_tool_ordering(vec![assistant]);
        assert_eq!(out.len(), 1);
        assert!(out[0].tool_calls.is_empty());
        assert_eq!(out[0].content, "let me check");
    }

    #[test]
    fn empty_assistant_without_answers_is_dropped() {
        let mut assistant = msg(MessageRole::Assistant, "");
        assistant.tool_calls = vec![ToolCall {
            id: "call_1".to_string(),
            name: "memory__search".to_string(),
            arguments: "{}".to_string(),
        }];
        let out = repair_tool_ordering(vec![assistant]);
        assert!(out.is_empty());
    }

    #[test]
    fn results_are_reattached_after_their_assistant() {
        let mut assistant = msg(MessageRole::Assistant, "");
        assistant.content = "checking".to_string();
        assistant.tool_calls = vec![
            ToolCall {
                id: "call_a".to_string(),
                name: "memory__search".to_string(),
                arguments: "{}".to_string(),
            },
            ToolCall {
                id: "call_b".to_string(),
                name: "web__fetch".to_string(),
                arguments: "{}".to_string(),
            },
        ];
        let mut result_b = msg(MessageRole::Tool, "{\"b\": true}");
        result_b.tool_call_id = Some("call_b".to_string());
        let mut result_a = msg(MessageRole::Tool, "{\"a\": true}");
        result_a.tool_call_id = Some("call_a".to_string());

        // Results arrive out of order and separated by a user message.
        let out = repair_tool_ordering(vec![
            assistant,
            result_b,
            msg(MessageRole::User, "interleaved"),
            result_a,
        ]);

        assert_eq!(out.len(), 4);
        assert_eq!(out[0].role, MessageRole::Assistant);
        assert_eq!(out[1].tool_call_id.as_deref(), Some("call_a"));
        assert_eq!(out[2].tool_call_id.as_deref(), Some("call_b"));
        assert_eq!(out[3].role, MessageRole::User);
    }
}
