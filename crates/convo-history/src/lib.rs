pub mod assembler;
pub mod error;
pub mod types;

pub use assembler::{assemble_branch_chain, curated_context, ui_history};
pub use error::HistoryError;
pub use types::{CuratedItem, HistoryMessage, HistoryPage, PageRequest};

#[cfg(test)]
mod tests {
    use super::*;
    use convo_core::types::MessageType;
    use convo_store::{types::NewMessage, MessageStore};
    use rusqlite::Connection;

    fn store() -> MessageStore {
        let conn = Connection::open_in_memory().unwrap();
        convo_store::db::init_db(&conn).unwrap();
        MessageStore::new(conn)
    }

    fn append(
        store: &MessageStore,
        session_id: &str,
        branch_id: &str,
        parent: Option<i64>,
        msg_type: MessageType,
        text: &str,
    ) -> convo_store::Message {
        store
            .append_message(
                session_id,
                branch_id,
                parent,
                NewMessage::new(msg_type, text),
            )
            .unwrap()
    }

    #[test]
    fn curated_drops_thoughts_and_errors() {
        let store = store();
        let (session, branch) = store.create_session("", "sp", "ws").unwrap();
        let u = append(&store, &session.id, &branch.id, None, MessageType::UserText, "hi");
        let t = append(
            &store,
            &session.id,
            &branch.id,
            Some(u.id),
            MessageType::Thought,
            "**Planning**\nneed to greet",
        );
        append(
            &store,
            &session.id,
            &branch.id,
            Some(t.id),
            MessageType::ModelText,
            "hi there",
        );

        let curated = curated_context(&store, &branch.id).unwrap();
        assert_eq!(curated.len(), 2);
        assert!(matches!(&curated[0], CuratedItem::Raw(h) if h.message.msg_type == MessageType::UserText));
        assert!(matches!(&curated[1], CuratedItem::Raw(h) if h.message.msg_type == MessageType::ModelText));
    }

    #[test]
    fn curated_drops_unanswered_function_call() {
        let store = store();
        let (session, branch) = store.create_session("", "sp", "ws").unwrap();
        let u = append(&store, &session.id, &branch.id, None, MessageType::UserText, "hi");
        append(
            &store,
            &session.id,
            &branch.id,
            Some(u.id),
            MessageType::FunctionCall,
            "{\"name\":\"echo\"}",
        );

        let curated = curated_context(&store, &branch.id).unwrap();
        assert_eq!(curated.len(), 1);
    }

    #[test]
    fn curated_keeps_answered_function_call() {
        let store = store();
        let (session, branch) = store.create_session("", "sp", "ws").unwrap();
        let u = append(&store, &session.id, &branch.id, None, MessageType::UserText, "hi");
        let fc = append(
            &store,
            &session.id,
            &branch.id,
            Some(u.id),
            MessageType::FunctionCall,
            "{\"name\":\"echo\"}",
        );
        append(
            &store,
            &session.id,
            &branch.id,
            Some(fc.id),
            MessageType::FunctionResponse,
            "{\"y\":\"hi\"}",
        );

        let curated = curated_context(&store, &branch.id).unwrap();
        assert_eq!(curated.len(), 3);
    }

    #[test]
    fn curated_collapses_double_user_text() {
        let store = store();
        let (session, branch) = store.create_session("", "sp", "ws").unwrap();
        let u1 = append(&store, &session.id, &branch.id, None, MessageType::UserText, "oops");
        append(
            &store,
            &session.id,
            &branch.id,
            Some(u1.id),
            MessageType::UserText,
            "real question",
        );

        let curated = curated_context(&store, &branch.id).unwrap();
        assert_eq!(curated.len(), 1);
        assert!(matches!(&curated[0], CuratedItem::Raw(h) if h.message.text == "real question"));
    }

    #[test]
    fn curated_expands_system_prompt_into_synthetic_pair() {
        let store = store();
        let (session, branch) = store.create_session("", "sp", "ws").unwrap();
        let u = append(&store, &session.id, &branch.id, None, MessageType::UserText, "hi");
        append(
            &store,
            &session.id,
            &branch.id,
            Some(u.id),
            MessageType::SystemPrompt,
            "you are now terse",
        );

        let curated = curated_context(&store, &branch.id).unwrap();
        assert_eq!(curated.len(), 2);
        assert!(matches!(
            &curated[1],
            CuratedItem::SystemPromptExpansion { prompt_text, .. } if prompt_text == "you are now terse"
        ));
    }

    #[test]
    fn ui_history_preserves_thoughts() {
        let store = store();
        let (session, branch) = store.create_session("", "sp", "ws").unwrap();
        let u = append(&store, &session.id, &branch.id, None, MessageType::UserText, "hi");
        append(
            &store,
            &session.id,
            &branch.id,
            Some(u.id),
            MessageType::Thought,
            "**Planning**\nneed to greet",
        );

        let page = ui_history(
            &store,
            &branch.id,
            PageRequest {
                before_message_id: 0,
                limit: 50,
            },
        )
        .unwrap();
        assert_eq!(page.messages.len(), 2);
        assert!(!page.has_more);
    }

    #[test]
    fn sibling_set_contains_both_branches_children() {
        let store = store();
        let (session, branch_a) = store.create_session("", "sp", "ws").unwrap();
        let model_a = append(
            &store,
            &session.id,
            &branch_a.id,
            None,
            MessageType::ModelText,
            "model-A",
        );
        let user_b = append(
            &store,
            &session.id,
            &branch_a.id,
            Some(model_a.id),
            MessageType::UserText,
            "user-B",
        );

        let branch_c = store
            .create_branch(&session.id, Some(&branch_a.id), Some(model_a.id))
            .unwrap();
        let user_c = append(
            &store,
            &session.id,
            &branch_c.id,
            Some(model_a.id),
            MessageType::UserText,
            "user-C",
        );

        let curated = curated_context(&store, &branch_c.id).unwrap();
        let model_a_item = curated
            .iter()
            .find_map(|item| match item {
                CuratedItem::Raw(h) if h.message.id == model_a.id => Some(h.clone()),
                _ => None,
            })
            .unwrap();
        assert!(model_a_item.possible_next.contains(&user_b.id));
        assert!(model_a_item.possible_next.contains(&user_c.id));
    }
}
