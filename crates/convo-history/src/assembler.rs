use std::collections::HashMap;

use convo_core::types::MessageType;
use convo_store::{Message, MessageStore};
use tracing::instrument;

use crate::error::Result;
use crate::types::{CuratedItem, HistoryMessage, HistoryPage, PageRequest};

/// Walk `branch_id` forward, recursing into the parent branch whenever the
/// branch's own earliest message has a parent outside it, so the result is
/// the full chronological (ascending-identifier) history this branch
/// represents — inherited ancestry first, then the branch's own messages.
#[instrument(skip(store))]
pub fn assemble_branch_chain(store: &MessageStore, branch_id: &str) -> Result<Vec<Message>> {
    let branch = store.fetch_branch(branch_id)?;
    let own = store.messages_in_branch(branch_id)?;

    let mut out = match (branch.parent_branch_id, branch.branch_from_message_id) {
        (Some(parent_branch_id), Some(fork_point)) => {
            let mut ancestor = assemble_branch_chain(store, &parent_branch_id)?;
            ancestor.retain(|m| m.id <= fork_point);
            ancestor
        }
        _ => Vec::new(),
    };
    out.extend(own);
    Ok(out)
}

/// Attach the "possible branches" sibling hint (children of each message)
/// computed against the live graph, independent of any curation.
fn with_sibling_hints(store: &MessageStore, messages: Vec<Message>) -> Result<Vec<HistoryMessage>> {
    let mut out = Vec::with_capacity(messages.len());
    for message in messages {
        let children = store.children_of(message.id)?;
        let possible_next = children.into_iter().map(|c| c.id).collect();
        out.push(HistoryMessage {
            message,
            possible_next,
        });
    }
    Ok(out)
}

/// Faithful UI history: thoughts, function calls, and compression markers
/// are included as raw text. Paginated on message identifier;
/// `before_message_id = 0` returns the most recent window. Internally
/// fetches one extra row past `limit` so the oldest *returned* message's
/// ancestry (and `has_more`) can be determined without a second query.
#[instrument(skip(store))]
pub fn ui_history(
    store: &MessageStore,
    branch_id: &str,
    page: PageRequest,
) -> Result<HistoryPage> {
    let full = assemble_branch_chain(store, branch_id)?;

    let candidates: Vec<&Message> = if page.before_message_id == 0 {
        full.iter().collect()
    } else {
        full.iter()
            .filter(|m| m.id < page.before_message_id)
            .collect()
    };

    let fetch_limit = page.limit + 1;
    let skip = candidates.len().saturating_sub(fetch_limit);
    let mut window: Vec<Message> = candidates[skip..].iter().map(|m| (*m).clone()).collect();

    let has_more = window.len() > page.limit;
    if has_more {
        // the lookahead row only existed to compute `has_more`/ancestry.
        window.remove(0);
    }

    let messages = with_sibling_hints(store, window)?;
    Ok(HistoryPage { messages, has_more })
}

/// Curated, LLM-facing context: discards thoughts and applies the §4.2
/// rewrite rules in order.
#[instrument(skip(store))]
pub fn curated_context(store: &MessageStore, branch_id: &str) -> Result<Vec<CuratedItem>> {
    let full = assemble_branch_chain(store, branch_id)?;
    let sibling_map = sibling_hints_for(store, &full)?;

    let mut working = full;

    apply_compression_cutoff(&mut working);
    apply_clear_marker(&mut working);
    apply_clearblobs_marker(&mut working);
    drop_unanswered_function_calls(&mut working);
    drop_duplicate_user_text(&mut working);
    drop_excluded_types(&mut working);

    let mut items: Vec<CuratedItem> = working
        .into_iter()
        .map(|m| match m.msg_type {
            MessageType::SystemPrompt | MessageType::EnvChanged => {
                CuratedItem::SystemPromptExpansion {
                    source_message_id: m.id,
                    prompt_text: m.text,
                }
            }
            _ => {
                let possible_next = sibling_map.get(&m.id).cloned().unwrap_or_default();
                CuratedItem::Raw(HistoryMessage {
                    message: m,
                    possible_next,
                })
            }
        })
        .collect();

    reposition_compression_first(&mut items);
    Ok(items)
}

fn sibling_hints_for(store: &MessageStore, messages: &[Message]) -> Result<HashMap<i64, Vec<i64>>> {
    let mut map = HashMap::with_capacity(messages.len());
    for m in messages {
        let children = store.children_of(m.id)?;
        map.insert(m.id, children.into_iter().map(|c| c.id).collect());
    }
    Ok(map)
}

/// Rule 1: ignore every message at or before the most recent compression
/// cutoff, keeping the compression message itself.
fn apply_compression_cutoff(messages: &mut Vec<Message>) {
    let Some(up_to_id) = messages
        .iter()
        .rev()
        .find(|m| m.msg_type == MessageType::Compression)
        .and_then(|m| m.text.split('\n').next())
        .and_then(|head| head.parse::<i64>().ok())
    else {
        return;
    };
    messages.retain(|m| m.id > up_to_id || m.msg_type == MessageType::Compression);
}

/// Rule 2: drop everything before the most recent `clear` command.
fn apply_clear_marker(messages: &mut Vec<Message>) {
    let Some(clear_id) = messages
        .iter()
        .rev()
        .find(|m| m.msg_type == MessageType::Command && m.text == "clear")
        .map(|m| m.id)
    else {
        return;
    };
    messages.retain(|m| m.id >= clear_id);
}

/// Rule 3: mark attachments on messages at or before the most recent
/// `clearblobs` command as omitted.
fn apply_clearblobs_marker(messages: &mut [Message]) {
    let Some(clearblobs_id) = messages
        .iter()
        .rev()
        .find(|m| m.msg_type == MessageType::Command && m.text == "clearblobs")
        .map(|m| m.id)
    else {
        return;
    };
    for m in messages.iter_mut() {
        if m.id <= clearblobs_id {
            for att in m.attachments.iter_mut() {
                att.omitted = true;
            }
        }
    }
}

/// Rule 4: drop a `function_call` unless immediately followed — ignoring
/// intervening `thought`s — by a `function_response`.
fn drop_unanswered_function_calls(messages: &mut Vec<Message>) {
    let mut keep = vec![true; messages.len()];
    for (i, m) in messages.iter().enumerate() {
        if m.msg_type != MessageType::FunctionCall {
            continue;
        }
        let mut answered = false;
        for next in messages.iter().skip(i + 1) {
            if next.msg_type == MessageType::Thought {
                continue;
            }
            answered = next.msg_type == MessageType::FunctionResponse;
            break;
        }
        keep[i] = answered;
    }
    let mut idx = 0;
    messages.retain(|_| {
        let k = keep[idx];
        idx += 1;
        k
    });
}

/// Rule 5: drop a `user_text` immediately followed — ignoring intervening
/// `error`/`model_error` — by another `user_text`.
fn drop_duplicate_user_text(messages: &mut Vec<Message>) {
    let mut keep = vec![true; messages.len()];
    for (i, m) in messages.iter().enumerate() {
        if m.msg_type != MessageType::UserText {
            continue;
        }
        for next in messages.iter().skip(i + 1) {
            if matches!(next.msg_type, MessageType::Error | MessageType::ModelError) {
                continue;
            }
            if next.msg_type == MessageType::UserText {
                keep[i] = false;
            }
            break;
        }
    }
    let mut idx = 0;
    messages.retain(|_| {
        let k = keep[idx];
        idx += 1;
        k
    });
}

/// Rule 6: thoughts, errors, and model errors never reach the provider.
fn drop_excluded_types(messages: &mut Vec<Message>) {
    messages.retain(|m| !m.msg_type.always_excluded_from_context());
}

/// Rule 8: a compression message, if present, leads the curated output.
fn reposition_compression_first(items: &mut Vec<CuratedItem>) {
    let pos = items.iter().position(|item| {
        matches!(item, CuratedItem::Raw(h) if h.message.msg_type == MessageType::Compression)
    });
    if let Some(pos) = pos {
        if pos != 0 {
            let compression = items.remove(pos);
            items.insert(0, compression);
        }
    }
}
