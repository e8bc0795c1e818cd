use super::*;

async fn storage_with_agent() -> (Storage, AgentId) {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let agent_id = storage
        .upsert_agent(&NewAgent {
            name: "assistant",
            avatar_url: Some("https://example.test/a.png"),
            is_default: true,
            model: "echo-1",
            model_provider: "local",
        })
        .await
        .expect("agent");
    (storage, agent_id)
}

#[tokio::test]
async fn health_check_succeeds_for_live_pool() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    storage.health_check().await.expect("health check");
}

#[tokio::test]
async fn creates_database_file_when_missing() {
    let temp_root = tempfile::tempdir().expect("tempdir");
    let db_path = temp_root.path().join("nested").join("storage.db");
    let database_url = format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"));

    let storage = Storage::new(&database_url).await.expect("db");
    drop(storage);

    assert!(
        db_path.exists(),
        "database file should exist: {}",
        db_path.display()
    );
}

#[tokio::test]
async fn upsert_agent_keeps_single_default() {
    let (storage, first) = storage_with_agent().await;
    let second = storage
        .upsert_agent(&NewAgent {
            name: "researcher",
            avatar_url: None,
            is_default: true,
            model: "echo-2",
            model_provider: "local",
        })
        .await
        .expect("second agent");

    assert_ne!(first, second);
    assert_eq!(storage.default_agent().await.expect("default"), Some(second));
    let first_agent = storage.get_agent(first).await.expect("get").expect("exists");
    assert!(!first_agent.is_default);
    assert_eq!(first_agent.avatar_url.as_deref(), Some("https://example.test/a.png"));
}

#[tokio::test]
async fn lists_conversations_pinned_first() {
    let (storage, agent) = storage_with_agent().await;
    let user = UserId(1);
    let older = storage
        .create_conversation(user, agent, "older")
        .await
        .expect("older");
    let newer = storage
        .create_conversation(user, agent, "newer")
        .await
        .expect("newer");
    storage
        .create_conversation(UserId(2), agent, "someone else")
        .await
        .expect("other user");

    assert!(storage
        .update_conversation(older.id, None, Some(true))
        .await
        .expect("pin"));

    let listed = storage
        .list_conversations_for_user(user)
        .await
        .expect("list");
    let ids: Vec<_> = listed.iter().map(|c| c.id).collect();
    assert_eq!(ids, vec![older.id, newer.id]);
    assert!(listed[0].pinned);
}

#[tokio::test]
async fn update_reports_missing_conversation() {
    let (storage, _agent) = storage_with_agent().await;
    let updated = storage
        .update_conversation(ConversationId(404), Some("renamed"), None)
        .await
        .expect("update");
    assert!(!updated);
}

#[tokio::test]
async fn messages_are_returned_in_insertion_order() {
    let (storage, agent) = storage_with_agent().await;
    let conversation = storage
        .create_conversation(UserId(1), agent, "chat")
        .await
        .expect("conversation");

    let (first, second) = storage
        .record_exchange(conversation.id, "hi", "hello there", "hello there")
        .await
        .expect("first exchange");
    let (third, fourth) = storage
        .record_exchange(conversation.id, "again", "hello again", "hello again")
        .await
        .expect("second exchange");

    let messages = storage
        .list_messages(conversation.id)
        .await
        .expect("messages");
    assert_eq!(messages, vec![first, second, third, fourth]);
}

#[tokio::test]
async fn delete_removes_conversation_and_messages() {
    let (storage, agent) = storage_with_agent().await;
    let conversation = storage
        .create_conversation(UserId(1), agent, "doomed")
        .await
        .expect("conversation");
    storage
        .record_exchange(conversation.id, "bye", "farewell", "farewell")
        .await
        .expect("exchange");

    assert!(storage
        .delete_conversation(conversation.id)
        .await
        .expect("delete"));
    assert!(storage
        .get_conversation(conversation.id)
        .await
        .expect("get")
        .is_none());
    assert!(storage
        .list_messages(conversation.id)
        .await
        .expect("messages")
        .is_empty());
    assert!(!storage
        .delete_conversation(conversation.id)
        .await
        .expect("second delete"));
}

#[tokio::test]
async fn record_exchange_stores_both_messages_and_preview() {
    let (storage, agent) = storage_with_agent().await;
    let conversation = storage
        .create_conversation(UserId(1), agent, "chat")
        .await
        .expect("conversation");

    let (user, reply) = storage
        .record_exchange(conversation.id, "question", "answer", "answer")
        .await
        .expect("exchange");
    assert_eq!(user.role, Role::User);
    assert_eq!(reply.role, Role::Assistant);
    assert!(reply.id > user.id);

    let messages = storage.list_messages(conversation.id).await.expect("list");
    assert_eq!(messages, vec![user, reply.clone()]);
    let stored = storage
        .get_conversation(conversation.id)
        .await
        .expect("get")
        .expect("exists");
    assert_eq!(stored.last_message_preview.as_deref(), Some("answer"));
    assert_eq!(stored.updated_at, reply.created_at);
}
