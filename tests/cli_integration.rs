mod common;

use assert_cmd::Command;
use common::create_temp_storage;
use lawchat_relay::storage::{MessageStore, Role};
use predicates::prelude::*;
use std::path::Path;

fn relay_cmd(db_path: &Path) -> Command {
    let mut cmd = Command::cargo_bin("lawchat-relay").unwrap();
    cmd.env("NO_COLOR", "1")
        .env_remove("RUST_LOG")
        .env_remove("LAWCHAT_DB_PATH")
        .arg("--config")
        .arg("does-not-exist.yaml")
        .arg("--db-path")
        .arg(db_path);
    cmd
}

#[test]
fn test_help_lists_commands() {
    Command::cargo_bin("lawchat-relay")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("serve"))
        .stdout(predicate::str::contains("history"));
}

#[test]
fn test_history_list_empty() {
    let (storage, _dir) = create_temp_storage();

    relay_cmd(storage.db_path())
        .args(["history", "list", "--user", "user-1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No chat history found for user-1"));
}

#[tokio::test]
async fn test_history_list_and_show_stored_chat() {
    let (storage, _dir) = create_temp_storage();
    let (chat, _) = storage
        .create_chat_with_message("user-1", "Can my landlord keep the deposit?")
        .await
        .unwrap();
    storage
        .create_message(&chat.id, Role::Assistant, "Only for unpaid rent or damage.", &[])
        .await
        .unwrap();
    storage.touch_chat(&chat.id).await.unwrap();

    relay_cmd(storage.db_path())
        .args(["history", "list", "--user", "user-1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Can my landlord keep the deposit?"));

    relay_cmd(storage.db_path())
        .args(["history", "show", &chat.id])
        .assert()
        .success()
        .stdout(predicate::str::contains("Only for unpaid rent or damage."));

    relay_cmd(storage.db_path())
        .args(["history", "delete", &chat.id])
        .assert()
        .success();
    assert!(storage.get_chat(&chat.id).await.unwrap().is_none());
}

#[test]
fn test_history_delete_unknown_chat_fails() {
    let (storage, _dir) = create_temp_storage();

    relay_cmd(storage.db_path())
        .args(["history", "delete", "missing-chat"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("Chat missing-chat not found."));
}

#[test]
fn test_invalid_webhook_url_is_rejected() {
    let (storage, _dir) = create_temp_storage();

    relay_cmd(storage.db_path())
        .env("LAWCHAT_WEBHOOK_URL", "not a url")
        .args(["history", "list", "--user", "user-1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("webhook.url"));
}
