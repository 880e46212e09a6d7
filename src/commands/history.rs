use crate::cli::HistoryCommand;
use crate::error::{RelayError, Result};
use crate::storage::{MessageStore, Role};
use colored::Colorize;
use prettytable::{format, Table};

fn short_id(id: &str) -> String {
    id.chars().take(8).collect()
}

fn clip(text: &str, max: usize) -> String {
    if text.chars().count() > max {
        let kept: String = text.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", kept)
    } else {
        text.to_string()
    }
}

/// Handle history commands
pub async fn handle_history(command: HistoryCommand, store: &dyn MessageStore) -> Result<()> {
    match command {
        HistoryCommand::List { user } => {
            let chats = store.list_valid_chats(&user).await?;

            if chats.is_empty() {
                println!("{}", format!("No chat history found for {}.", user).yellow());
                return Ok(());
            }

            let mut table = Table::new();
            table.set_format(*format::consts::FORMAT_BORDERS_ONLY);

            table.add_row(prettytable::row![
                "ID".bold(),
                "Title".bold(),
                "Preview".bold(),
                "Last Updated".bold()
            ]);

            for chat in chats {
                let preview = chat
                    .preview
                    .as_deref()
                    .map(|p| clip(p, 40))
                    .unwrap_or_else(|| "-".to_string());
                let updated = chat.updated_at.format("%Y-%m-%d %H:%M").to_string();

                table.add_row(prettytable::row![
                    short_id(&chat.id).cyan(),
                    clip(&chat.title, 40),
                    preview,
                    updated
                ]);
            }

            println!("\nChat History:");
            table.printstd();
            println!();
            println!(
                "Use {} to read a session.",
                "lawchat-relay history show <ID>".cyan()
            );
            println!();
        }
        HistoryCommand::Show { id } => {
            let chat = store
                .get_chat(&id)
                .await?
                .ok_or_else(|| RelayError::NotFound(format!("chat {}", id)))?;
            let messages = store.list_messages(&id).await?;

            println!();
            println!("{} {}", chat.title.bold(), format!("({})", chat.id).dimmed());
            println!(
                "{}",
                format!(
                    "user {} | created {} | {} messages",
                    chat.user_id,
                    chat.created_at.format("%Y-%m-%d %H:%M"),
                    messages.len()
                )
                .dimmed()
            );

            for message in messages {
                let label = match message.role {
                    Role::User => "You".green().bold(),
                    Role::Assistant => "Assistant".blue().bold(),
                };
                println!();
                println!("{} {}", label, message.created_at.format("%H:%M:%S").to_string().dimmed());
                println!("{}", message.content);
                if !message.references.is_empty() {
                    println!("{}", format!("  {} sources", message.references.len()).dimmed());
                }
            }
            println!();
        }
        HistoryCommand::Delete { id } => {
            if !store.delete_chat(&id).await? {
                println!("{}", format!("Chat {} not found.", id).yellow());
                return Err(RelayError::NotFound(format!("chat {}", id)).into());
            }
            println!("{}", format!("Deleted chat {}", id).green());
        }
    }

    Ok(())
}
