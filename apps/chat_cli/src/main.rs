use std::{collections::HashMap, io::Write, path::PathBuf, sync::Arc};

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use client_core::{
    load_client_settings, ChatBackend, ChatSession, ClientEvent, ConversationSummary,
    HttpChatBackend, LoadOutcome, MessageKey, Selection,
};
use shared::domain::{AgentId, ConversationId, Role};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::{broadcast, oneshot},
    task::JoinHandle,
};
use tracing::warn;

#[derive(Parser, Debug)]
struct Cli {
    /// Settings file; defaults to ./oneapp.toml when present.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    user_id: Option<i64>,
    #[arg(long)]
    agent_id: Option<i64>,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Interactive chat (default).
    Chat,
    List {
        #[arg(long)]
        search: Option<String>,
    },
    History {
        conversation_id: i64,
    },
    Send {
        text: String,
        /// Existing conversation; a new one is created when omitted.
        #[arg(long)]
        conversation: Option<i64>,
    },
    Rename {
        conversation_id: i64,
        title: String,
    },
    Pin {
        conversation_id: i64,
    },
    Unpin {
        conversation_id: i64,
    },
    Delete {
        conversation_id: i64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ReplCommand {
    Send(String),
    New,
    List,
    Open(i64),
    Rename(String),
    TogglePin,
    Delete,
    Regenerate,
    Search(String),
    Help,
    Quit,
    Empty,
    Invalid(String),
}

fn parse_line(line: &str) -> ReplCommand {
    let line = line.trim();
    if line.is_empty() {
        return ReplCommand::Empty;
    }
    let Some(rest) = line.strip_prefix('/') else {
        return ReplCommand::Send(line.to_string());
    };
    let (name, arg) = match rest.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (rest, ""),
    };
    match name {
        "new" => ReplCommand::New,
        "list" => ReplCommand::List,
        "open" => arg
            .parse()
            .map(ReplCommand::Open)
            .unwrap_or_else(|_| ReplCommand::Invalid(format!("not a conversation id: {arg:?}"))),
        "rename" if !arg.is_empty() => ReplCommand::Rename(arg.to_string()),
        "rename" => ReplCommand::Invalid("usage: /rename <title>".to_string()),
        "pin" => ReplCommand::TogglePin,
        "delete" => ReplCommand::Delete,
        "regen" => ReplCommand::Regenerate,
        "search" => ReplCommand::Search(arg.to_string()),
        "help" => ReplCommand::Help,
        "quit" | "exit" => ReplCommand::Quit,
        other => ReplCommand::Invalid(format!("unknown command /{other}")),
    }
}

const HELP: &str = "\
commands:
  <text>            send a message
  /new              start a new conversation
  /list             list conversations
  /open <id>        open a conversation
  /rename <title>   rename the open conversation
  /pin              pin or unpin the open conversation
  /delete           delete the open conversation
  /regen            regenerate the last reply
  /search <query>   filter the conversation list
  /quit             leave";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut settings = load_client_settings(cli.config.as_deref())?;
    if let Some(server_url) = cli.server_url {
        settings.server_url = server_url;
    }
    if let Some(user_id) = cli.user_id {
        settings.user_id = user_id;
    }

    let backend = Arc::new(HttpChatBackend::new(
        &settings.server_url,
        settings.request_timeout(),
    )?);
    let agent_id = match cli.agent_id.map(AgentId).or(settings.default_agent()) {
        Some(agent_id) => agent_id,
        None => {
            backend
                .default_agent()
                .await
                .context("failed to resolve the default agent")?
                .agent_id
        }
    };
    let session = ChatSession::new(
        Arc::clone(&backend) as Arc<dyn ChatBackend>,
        settings.session_options(),
    );
    session.refresh_conversations().await?;

    match cli.command.unwrap_or(Command::Chat) {
        Command::Chat => repl(&session, agent_id).await?,
        Command::List { search } => {
            let listed = match search {
                Some(query) => session.set_search_query(&query).await,
                None => session.snapshot().await.visible_conversations(),
            };
            print_conversations(&listed);
        }
        Command::History { conversation_id } => {
            open(&session, ConversationId(conversation_id)).await?;
            print_history(&session).await;
        }
        Command::Send { text, conversation } => {
            match conversation {
                Some(id) => open(&session, ConversationId(id)).await?,
                None => session.start_new_conversation().await,
            }
            let renderer = Renderer::spawn(session.subscribe_events());
            let outcome = session.send(&text, Some(agent_id)).await;
            session.wait_for_reveal().await;
            let printer = renderer.finish().await;
            let outcome = outcome?;
            if printer.shown(&outcome.assistant_message.id) == 0 {
                println!("assistant> {}", outcome.assistant_message.content);
            }
            println!();
            println!("conversation_id={}", outcome.conversation_id);
        }
        Command::Rename {
            conversation_id,
            title,
        } => {
            session
                .rename_conversation(ConversationId(conversation_id), &title)
                .await?;
            println!("renamed {conversation_id}");
        }
        Command::Pin { conversation_id } => {
            session.set_pinned(ConversationId(conversation_id), true).await?;
            println!("pinned {conversation_id}");
        }
        Command::Unpin { conversation_id } => {
            session.set_pinned(ConversationId(conversation_id), false).await?;
            println!("unpinned {conversation_id}");
        }
        Command::Delete { conversation_id } => {
            session
                .delete_conversation(ConversationId(conversation_id))
                .await?;
            println!("deleted {conversation_id}");
        }
    }
    Ok(())
}

async fn open(session: &ChatSession, conversation_id: ConversationId) -> Result<()> {
    match session.select_conversation(conversation_id).await {
        LoadOutcome::Applied { .. } | LoadOutcome::Stale => Ok(()),
        LoadOutcome::Failed(reason) => Err(anyhow!(
            "failed to open conversation {conversation_id}: {reason}"
        )),
    }
}

async fn repl(session: &Arc<ChatSession>, agent_id: AgentId) -> Result<()> {
    let renderer = Renderer::spawn(session.subscribe_events());
    match session.snapshot().await.visible_conversations().first() {
        Some(latest) => open(session, latest.id).await?,
        None => session.start_new_conversation().await,
    }
    print_header(session).await;
    print_history(session).await;
    println!("type /help for commands");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match parse_line(&line) {
            ReplCommand::Empty => {}
            ReplCommand::Quit => break,
            ReplCommand::Help => println!("{HELP}"),
            ReplCommand::Invalid(message) => println!("{message}"),
            ReplCommand::Send(text) => {
                if let Err(err) = session.send(&text, Some(agent_id)).await {
                    println!("! {err}");
                }
                session.wait_for_reveal().await;
            }
            ReplCommand::New => {
                session.start_new_conversation().await;
                print_header(session).await;
            }
            ReplCommand::List => {
                print_conversations(&session.snapshot().await.visible_conversations());
            }
            ReplCommand::Search(query) => {
                print_conversations(&session.set_search_query(&query).await);
            }
            ReplCommand::Open(id) => match open(session, ConversationId(id)).await {
                Ok(()) => {
                    print_header(session).await;
                    print_history(session).await;
                }
                Err(err) => println!("! {err:#}"),
            },
            ReplCommand::Rename(title) => match current(session).await {
                Some(id) => report(session.rename_conversation(id, &title).await),
                None => println!("nothing to rename yet"),
            },
            ReplCommand::TogglePin => match current(session).await {
                Some(id) => match session.toggle_pin(id).await {
                    Ok(pinned) => println!("{}", if pinned { "pinned" } else { "unpinned" }),
                    Err(err) => println!("! {err}"),
                },
                None => println!("nothing to pin yet"),
            },
            ReplCommand::Delete => match current(session).await {
                Some(id) => {
                    report(session.delete_conversation(id).await);
                    print_header(session).await;
                }
                None => println!("nothing to delete yet"),
            },
            ReplCommand::Regenerate => {
                let last_reply = session
                    .snapshot()
                    .await
                    .messages()
                    .iter()
                    .rev()
                    .find(|message| message.role == Role::Assistant)
                    .map(|message| message.id.clone());
                match last_reply {
                    Some(reply) => match session.regenerate(&reply, Some(agent_id)).await {
                        Ok(Some(_)) => session.wait_for_reveal().await,
                        Ok(None) => println!("nothing to regenerate"),
                        Err(err) => println!("! {err}"),
                    },
                    None => println!("nothing to regenerate"),
                }
            }
        }
    }
    renderer.finish().await;
    Ok(())
}

async fn current(session: &ChatSession) -> Option<ConversationId> {
    match session.snapshot().await.selection() {
        Selection::Ready(Some(id)) | Selection::Loading(id) => Some(id),
        Selection::Ready(None) | Selection::Idle => None,
    }
}

fn report(result: Result<(), client_core::ChatError>) {
    if let Err(err) = result {
        println!("! {err}");
    }
}

async fn print_header(session: &ChatSession) {
    let state = session.snapshot().await;
    match state.selection().conversation_id() {
        Some(id) => println!("== {} (#{id}) ==", state.title()),
        None => println!("== {} ==", state.title()),
    }
}

async fn print_history(session: &ChatSession) {
    for message in session.snapshot().await.messages() {
        let who = match message.role {
            Role::User => "you",
            Role::Assistant if message.is_error => "error",
            Role::Assistant => "assistant",
        };
        println!("{who}> {}", message.content);
    }
}

fn print_conversations(conversations: &[ConversationSummary]) {
    if conversations.is_empty() {
        println!("(no conversations)");
    }
    for summary in conversations {
        let pin = if summary.pinned { "*" } else { " " };
        let preview = summary.last_message_preview.as_deref().unwrap_or("");
        println!(
            "{pin} #{:<5} {:<32} {}  {preview}",
            summary.id.0,
            summary.title,
            summary.updated_at.format("%Y-%m-%d %H:%M")
        );
    }
}

/// Prints reveal frames as they grow, plus thinking status and errors.
/// Terminal view of session events. Reveal frames carry the whole visible
/// prefix, so only the unseen tail is printed.
#[derive(Debug, Default)]
struct EventPrinter {
    printed: HashMap<MessageKey, usize>,
    thinking: bool,
}

impl EventPrinter {
    fn show(&mut self, event: ClientEvent) {
        match event {
            ClientEvent::Thinking { text, .. } if !self.thinking => {
                self.thinking = true;
                eprintln!("... {text}");
            }
            ClientEvent::ThinkingStopped => self.thinking = false,
            ClientEvent::Reveal {
                message,
                text,
                done,
            } => {
                let shown = self.printed.entry(message).or_insert(0);
                if *shown == 0 {
                    print!("assistant> ");
                }
                if let Some(delta) = text.get(*shown..) {
                    print!("{delta}");
                }
                *shown = text.len();
                if done {
                    println!();
                }
                let _ = std::io::stdout().flush();
            }
            ClientEvent::Error(message) => eprintln!("! {message}"),
            _ => {}
        }
    }

    fn shown(&self, message: &MessageKey) -> usize {
        self.printed.get(message).copied().unwrap_or(0)
    }
}

struct Renderer {
    task: JoinHandle<EventPrinter>,
    shutdown: oneshot::Sender<()>,
}

impl Renderer {
    fn spawn(events: broadcast::Receiver<ClientEvent>) -> Self {
        let (shutdown, stop) = oneshot::channel();
        Self {
            task: tokio::spawn(render_events(events, stop)),
            shutdown,
        }
    }

    /// Prints everything already queued, then stops.
    async fn finish(self) -> EventPrinter {
        let _ = self.shutdown.send(());
        match self.task.await {
            Ok(printer) => printer,
            Err(err) => {
                warn!(error = %err, "event renderer stopped abnormally");
                EventPrinter::default()
            }
        }
    }
}

async fn render_events(
    mut events: broadcast::Receiver<ClientEvent>,
    mut stop: oneshot::Receiver<()>,
) -> EventPrinter {
    let mut printer = EventPrinter::default();
    loop {
        tokio::select! {
            received = events.recv() => match received {
                Ok(event) => printer.show(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event renderer fell behind");
                }
                Err(broadcast::error::RecvError::Closed) => return printer,
            },
            _ = &mut stop => break,
        }
    }
    loop {
        match events.try_recv() {
            Ok(event) => printer.show(event),
            Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                warn!(skipped, "event renderer fell behind");
            }
            Err(_) => return printer,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_sent() {
        assert_eq!(parse_line("  hello there "), ReplCommand::Send("hello there".to_string()));
        assert_eq!(parse_line("   "), ReplCommand::Empty);
    }

    #[test]
    fn slash_commands_parse_arguments() {
        assert_eq!(parse_line("/open 12"), ReplCommand::Open(12));
        assert_eq!(parse_line("/rename  Weekend plans "), ReplCommand::Rename("Weekend plans".to_string()));
        assert_eq!(parse_line("/search"), ReplCommand::Search(String::new()));
        assert_eq!(parse_line("/exit"), ReplCommand::Quit);
        assert!(matches!(parse_line("/open twelve"), ReplCommand::Invalid(_)));
        assert!(matches!(parse_line("/rename"), ReplCommand::Invalid(_)));
        assert!(matches!(parse_line("/dance"), ReplCommand::Invalid(_)));
    }

    #[tokio::test]
    async fn finishing_prints_frames_already_queued() {
        let (events, receiver) = broadcast::channel(16);
        let reply = MessageKey::Server(shared::domain::MessageId(7));
        let renderer = Renderer::spawn(receiver);
        for (text, done) in [("Hel", false), ("Hello wo", false), ("Hello world", true)] {
            events
                .send(ClientEvent::Reveal {
                    message: reply.clone(),
                    text: text.to_string(),
                    done,
                })
                .expect("renderer subscribed");
        }

        let printer = renderer.finish().await;
        assert_eq!(printer.shown(&reply), "Hello world".len());
    }

    #[tokio::test]
    async fn renderer_stops_when_session_goes_away() {
        let (events, receiver) = broadcast::channel::<ClientEvent>(4);
        let renderer = Renderer::spawn(receiver);
        drop(events);
        let printer = renderer.finish().await;
        assert!(!printer.thinking);
    }
}
