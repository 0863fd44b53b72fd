//! Chatsync - headless chat client
//!
//! Logs in with credentials from the environment, prints what happens in
//! the selected conversation and sends each stdin line as a message.

use anyhow::{Context, Result};
use chatsync_client::{logging, ChatClient, ChatState, ClientConfig, ConnectionState, Identity, Notice};
use chatsync_shared::{ConversationId, MessageId};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

#[derive(Debug, PartialEq, Eq)]
enum Input {
    Send(String),
    Select(ConversationId),
    New(String),
    Close,
    Read,
    List,
    More,
    Quit,
    Invalid(String),
}

fn parse_input(line: &str) -> Input {
    let line = line.trim();
    let Some(command) = line.strip_prefix('/') else {
        return Input::Send(line.to_string());
    };
    let (name, rest) = command.split_once(' ').unwrap_or((command, ""));
    let rest = rest.trim();
    match name {
        "quit" | "q" => Input::Quit,
        "close" => Input::Close,
        "read" => Input::Read,
        "list" => Input::List,
        "more" => Input::More,
        "select" => match rest.parse() {
            Ok(id) => Input::Select(id),
            Err(_) => Input::Invalid(format!("not a conversation id: {rest:?}")),
        },
        "new" if !rest.is_empty() => Input::New(rest.to_string()),
        "new" => Input::Invalid("usage: /new <first message>".to_string()),
        other => Input::Invalid(format!("unknown command /{other}")),
    }
}

/// What has already been printed, so each snapshot only prints news.
#[derive(Default)]
struct Printed {
    connection: Option<ConnectionState>,
    conversation: Option<ConversationId>,
    last_message: Option<MessageId>,
    typing: Vec<i64>,
}

impl Printed {
    fn render(&mut self, state: &ChatState) {
        if self.connection.as_ref() != Some(&state.connection) {
            println!("* connection: {:?}", state.connection);
            self.connection = Some(state.connection.clone());
        }

        let Some(active) = state.active.as_ref() else {
            return;
        };
        if self.conversation != Some(active.id) {
            println!("* conversation {}", active.id);
            self.conversation = Some(active.id);
            self.last_message = None;
            self.typing.clear();
        }
        for message in active.messages.as_slice() {
            if self.last_message.is_some_and(|last| message.id <= last) {
                continue;
            }
            let sender = message
                .sender_name
                .clone()
                .unwrap_or_else(|| format!("user {}", message.sender_id));
            println!("[{}] {}: {}", message.created_at.format("%H:%M"), sender, message.content);
            self.last_message = Some(message.id);
        }
        let typing: Vec<i64> = active.typing_users.iter().copied().collect();
        if typing != self.typing {
            if !typing.is_empty() {
                println!("* typing: {typing:?}");
            }
            self.typing = typing;
        }
    }
}

fn print_conversations(state: &ChatState) {
    for conversation in &state.conversations {
        let names: Vec<&str> = conversation.counterparts().map(|p| p.name.as_str()).collect();
        println!(
            "  {:>5} {:?} with {} ({} unread){}",
            conversation.id,
            conversation.status,
            names.join(", "),
            conversation.unread_count,
            if conversation.participant_online { " online" } else { "" }
        );
    }
    if state.has_more_conversations {
        println!("  ... /more for the next page");
    }
}

fn env(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("{key} is not set"))
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();

    let config = ClientConfig::from_env();
    let credential = env("CHATSYNC_TOKEN")?;
    let user_id: i64 = env("CHATSYNC_USER_ID")?
        .parse()
        .context("CHATSYNC_USER_ID must be a number")?;
    let principal = std::env::var("CHATSYNC_PRINCIPAL").unwrap_or_else(|_| user_id.to_string());
    let initial: Option<ConversationId> = std::env::args()
        .nth(1)
        .map(|arg| arg.parse())
        .transpose()
        .context("conversation id must be a number")?;

    let client = ChatClient::login(config, &credential, Identity { user_id, principal });
    if let Some(id) = initial {
        client.select(id);
    }

    let mut state = client.state();
    let mut notices = client.notices();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut printed = Printed::default();

    loop {
        tokio::select! {
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = state.borrow_and_update().clone();
                printed.render(&snapshot);
            }
            notice = notices.recv() => match notice {
                Ok(Notice::SendFailed { draft, reason, .. }) => {
                    eprintln!("! not sent ({reason}), draft: {draft}");
                }
                Ok(notice) => eprintln!("! {notice:?}"),
                Err(RecvError::Lagged(skipped)) => eprintln!("! {skipped} notices skipped"),
                Err(RecvError::Closed) => break,
            },
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read stdin")? else {
                    break;
                };
                match parse_input(&line) {
                    Input::Send(text) if text.is_empty() => {}
                    Input::Send(text) => {
                        client.keystroke();
                        if let Err(e) = client.send(text).await {
                            eprintln!("! {e}");
                        }
                    }
                    Input::Select(id) => client.select(id),
                    Input::New(text) => client.create_conversation(text),
                    Input::Close => match client.snapshot().active_id() {
                        Some(id) => client.close_conversation(id),
                        None => eprintln!("! no conversation selected"),
                    },
                    Input::Read => match client.snapshot().active_id() {
                        Some(id) => client.mark_read(id),
                        None => eprintln!("! no conversation selected"),
                    },
                    Input::List => print_conversations(&client.snapshot()),
                    Input::More => client.load_conversations(client.snapshot().conversations_page + 1),
                    Input::Quit => break,
                    Input::Invalid(reason) => eprintln!("! {reason}"),
                }
            }
        }
    }

    client.logout().await;
    Ok(())
}
