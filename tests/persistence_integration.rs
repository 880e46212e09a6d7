mod common;

use common::{create_temp_storage, CountingStore};
use lawchat_relay::retry::RetryPolicy;
use lawchat_relay::storage::{MessageStore, Role};
use lawchat_relay::stream::persist::SaveOutcome;
use lawchat_relay::stream::MessagePersister;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn quick_retry(attempts: u32) -> RetryPolicy {
    RetryPolicy::new(attempts, Duration::from_millis(5), Duration::from_millis(20))
}

#[tokio::test]
async fn test_final_save_wins_over_throttled_progress() {
    let (storage, _dir) = create_temp_storage();
    let store = CountingStore::new(storage);
    let (chat, _) = store
        .create_chat_with_message("user-1", "Question")
        .await
        .unwrap();

    let dyn_store: Arc<dyn MessageStore> = store.clone();
    let mut persister = MessagePersister::new(
        dyn_store,
        chat.id.clone(),
        quick_retry(3),
        Duration::from_millis(100),
    );

    assert_eq!(persister.save_progress("", &[]).await, SaveOutcome::Empty);
    assert_eq!(persister.save_progress("Hel", &[]).await, SaveOutcome::Created);
    assert_eq!(persister.save_progress("Hello", &[]).await, SaveOutcome::Throttled);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(persister.save_progress("Hello wor", &[]).await, SaveOutcome::Started);
    assert_eq!(persister.save_progress("Hello worl", &[]).await, SaveOutcome::Throttled);

    let references = vec![json!({"title": "Case A"})];
    assert!(persister.finalize("Hello world.", &references).await);

    assert_eq!(store.create_count(), 1);
    assert_eq!(store.update_count(), 2);

    let messages = store.list_messages(&chat.id).await.unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].role, Role::Assistant);
    assert_eq!(messages[1].content, "Hello world.");
    assert_eq!(messages[1].references, references);
    assert_eq!(persister.message_id(), Some(messages[1].id.as_str()));

    let chat = store.get_chat(&chat.id).await.unwrap().unwrap();
    assert_eq!(chat.preview.as_deref(), Some("Hello world."));
    let listed = store.list_valid_chats("user-1").await.unwrap();
    assert_eq!(listed.len(), 1);
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let (storage, _dir) = create_temp_storage();
    let store = CountingStore::failing_updates(storage, 2);
    let (chat, _) = store
        .create_chat_with_message("user-1", "Question")
        .await
        .unwrap();

    let dyn_store: Arc<dyn MessageStore> = store.clone();
    let mut persister =
        MessagePersister::new(dyn_store, chat.id.clone(), quick_retry(3), Duration::ZERO);

    persister.save_progress("Partial", &[]).await;
    assert!(persister.finalize("Partial answer.", &[]).await);
    assert_eq!(store.update_count(), 3);

    let messages = store.list_messages(&chat.id).await.unwrap();
    assert_eq!(messages[1].content, "Partial answer.");
}

#[tokio::test]
async fn test_exhausted_retries_keep_last_good_content() {
    let (storage, _dir) = create_temp_storage();
    let store = CountingStore::failing_updates(storage, 10);
    let (chat, _) = store
        .create_chat_with_message("user-1", "Question")
        .await
        .unwrap();

    let dyn_store: Arc<dyn MessageStore> = store.clone();
    let mut persister =
        MessagePersister::new(dyn_store, chat.id.clone(), quick_retry(2), Duration::ZERO);

    persister.save_progress("First part", &[]).await;
    assert!(!persister.finalize("First part and the rest.", &[]).await);
    assert_eq!(store.update_count(), 2);

    let messages = store.list_messages(&chat.id).await.unwrap();
    assert_eq!(messages[1].content, "First part");
}

#[tokio::test]
async fn test_turn_without_answer_stays_out_of_history() {
    let (storage, _dir) = create_temp_storage();
    let store: Arc<dyn MessageStore> = Arc::new(storage);
    let (chat, _) = store
        .create_chat_with_message("user-1", "Question")
        .await
        .unwrap();

    let mut persister =
        MessagePersister::new(store.clone(), chat.id.clone(), quick_retry(1), Duration::ZERO);
    assert!(!persister.finalize("", &[]).await);

    assert_eq!(store.list_messages(&chat.id).await.unwrap().len(), 1);
    assert!(store.list_valid_chats("user-1").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_update_of_deleted_chat_is_not_retried() {
    let (storage, _dir) = create_temp_storage();
    let store = CountingStore::new(storage);
    let (chat, _) = store
        .create_chat_with_message("user-1", "Question")
        .await
        .unwrap();

    let dyn_store: Arc<dyn MessageStore> = store.clone();
    let mut persister =
        MessagePersister::new(dyn_store, chat.id.clone(), quick_retry(4), Duration::ZERO);
    persister.save_progress("Answer", &[]).await;

    assert!(store.delete_chat(&chat.id).await.unwrap());
    assert!(!persister.finalize("Answer, finished.", &[]).await);
    assert_eq!(store.update_count(), 1);
}
