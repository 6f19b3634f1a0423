use std::collections::HashMap;

use anyhow::Context;
use clap::{Parser, Subcommand};
use supportdesk_chats::{Message, MessageStatus, Sender, SenderKind, SessionEvent, SessionManager};
use supportdesk_config::load as load_config;
use supportdesk_runtime::{telemetry, ClientServices};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "supportdesk")]
#[command(about = "Supportdesk agent console (interactive by default)")]
struct Cli {
    /// Use the in-process loopback backend instead of the websocket
    #[arg(long, global = true)]
    offline: bool,

    /// Backend token
    #[arg(long, env = "SUPPORTDESK_TOKEN", default_value = "", global = true)]
    token: String,

    /// Participant id of the agent using the console
    #[arg(long, env = "SUPPORTDESK_AGENT_ID", default_value = "agent", global = true)]
    agent_id: String,

    /// Display name announced in presence
    #[arg(long, env = "SUPPORTDESK_AGENT_NAME", global = true)]
    agent_name: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start interactive console (default)
    Console,
    /// Print the effective configuration
    ShowConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::ShowConfig) => show_config(),
        Some(Commands::Console) | None => run_console(&cli).await,
    }
}

fn show_config() -> anyhow::Result<()> {
    let config = load_config().context("failed to load configuration")?;
    println!(
        "{}",
        serde_json::to_string_pretty(&config).context("failed to render configuration")?
    );
    Ok(())
}

fn identity(cli: &Cli) -> Sender {
    let sender = Sender::new(cli.agent_id.clone(), SenderKind::Agent);
    match &cli.agent_name {
        Some(name) => sender.named(name.clone()),
        None => sender,
    }
}

async fn run_console(cli: &Cli) -> anyhow::Result<()> {
    telemetry::init_tracing().context("failed to initialise tracing")?;

    info!("starting interactive console");

    let config = load_config().context("failed to load configuration")?;
    let services = if cli.offline {
        ClientServices::offline(&config, identity(cli))
    } else {
        ClientServices::initialise(&config, identity(cli))
    };
    services
        .start(cli.token.clone())
        .await
        .context("failed to start client services")?;

    let sessions = services.sessions.clone();
    let (current_tx, current_rx) = watch::channel::<Option<String>>(None);
    let printer = tokio::spawn(print_events(sessions.clone(), current_rx));

    println!("Supportdesk Agent Console");
    println!("Type '/open <conversation>' to start, plain text sends a message");
    println!("Use Ctrl+C or '/quit' to exit");
    println!("---");

    let stdin = tokio::io::stdin();
    let mut reader = BufReader::new(stdin);
    let mut line = String::new();

    loop {
        print!("> ");
        std::io::Write::flush(&mut std::io::stdout())?;

        line.clear();
        let bytes_read = tokio::select! {
            read = reader.read_line(&mut line) => read?,
            _ = supportdesk_runtime::shutdown_signal() => 0,
        };
        if bytes_read == 0 {
            break; // EOF
        }

        let input = line.trim();
        if input.is_empty() {
            continue;
        }

        let (command, argument) = match input.split_once(' ') {
            Some((command, argument)) => (command, argument.trim()),
            None => (input, ""),
        };
        let current = current_tx.borrow().clone();

        match command {
            "/quit" | "/exit" | "/q" => {
                println!("Goodbye!");
                break;
            }
            "/help" | "/h" => print_help(),
            "/open" | "/o" => {
                if argument.is_empty() {
                    println!("Usage: /open <conversation>");
                    continue;
                }
                match sessions.open_conversation(argument).await {
                    Ok(()) => {
                        current_tx.send_replace(Some(argument.to_string()));
                        print_log(&sessions.messages(argument));
                    }
                    Err(error) => println!("Could not open {argument}: {error}"),
                }
            }
            "/list" | "/l" => {
                let conversations = sessions.conversations();
                if conversations.is_empty() {
                    println!("No conversations yet");
                }
                for conversation in conversations {
                    let phase = sessions
                        .phase(&conversation.id)
                        .map(|phase| phase.to_string())
                        .unwrap_or_default();
                    println!(
                        "  {} {} [{}] unread: {}",
                        if current.as_deref() == Some(conversation.id.as_str()) { "*" } else { " " },
                        conversation.title,
                        phase,
                        conversation.unread_count
                    );
                }
            }
            "/unread" | "/u" => println!("Unread: {}", sessions.total_unread()),
            "/state" | "/s" => println!("Connection: {}", sessions.connection_state()),
            _ => {
                let Some(conversation_id) = current else {
                    if command.starts_with('/') {
                        println!("Unknown command: {command}");
                        println!("Type '/help' for available commands");
                    } else {
                        println!("Open a conversation first with '/open <conversation>'");
                    }
                    continue;
                };
                if let Err(error) =
                    conversation_command(&sessions, &conversation_id, command, argument, input).await
                {
                    warn!(%error, command, "command failed");
                    println!("{error}");
                }
                if matches!(command, "/close" | "/c" | "/archive") {
                    current_tx.send_replace(None);
                }
            }
        }
    }

    printer.abort();
    services.shutdown().await;
    info!("console shut down");
    Ok(())
}

async fn conversation_command(
    sessions: &SessionManager,
    conversation_id: &str,
    command: &str,
    argument: &str,
    input: &str,
) -> anyhow::Result<()> {
    match command {
        "/close" | "/c" => sessions.close_conversation(conversation_id)?,
        "/archive" => sessions.archive_conversation(conversation_id)?,
        "/older" => {
            let added = sessions.load_older_messages(conversation_id).await?;
            println!("Loaded {added} older messages");
            print_log(&sessions.messages(conversation_id));
        }
        "/history" => print_log(&sessions.messages(conversation_id)),
        "/read" | "/r" => {
            sessions.mark_as_read(conversation_id).await?;
            println!("Marked {conversation_id} as read");
        }
        "/typing" | "/t" => {
            let is_typing = argument != "off";
            sessions.notify_typing(conversation_id, is_typing).await?;
        }
        "/retry" => sessions.retry_message(argument).await?,
        "/discard" => sessions.discard_message(argument)?,
        "/who" => {
            for entry in sessions.presence(conversation_id) {
                println!("  {} ({:?})", entry.display_name, entry.status);
            }
        }
        _ if command.starts_with('/') => {
            println!("Unknown command: {command}");
            println!("Type '/help' for available commands");
        }
        _ => {
            sessions.send_message(conversation_id, input, Vec::new()).await?;
        }
    }
    Ok(())
}

fn print_help() {
    println!("Available commands:");
    println!("  /open, /o <id>     - Open a conversation");
    println!("  /close, /c         - Background the open conversation");
    println!("  /archive           - Forget the open conversation");
    println!("  /list, /l          - List known conversations");
    println!("  /history           - Show the loaded messages");
    println!("  /older             - Load older messages");
    println!("  /read, /r          - Mark the conversation as read");
    println!("  /typing, /t [off]  - Send a typing signal");
    println!("  /retry <id>        - Retry a failed message");
    println!("  /discard <id>      - Drop a failed message");
    println!("  /who               - Show presence");
    println!("  /unread, /u        - Total unread messages");
    println!("  /state, /s         - Connection state");
    println!("  /quit, /exit, /q   - Exit console");
    println!("Anything else is sent to the open conversation.");
}

fn print_log(messages: &[Message]) {
    if messages.is_empty() {
        println!("No messages loaded");
    }
    for message in messages {
        print_message(message);
    }
}

fn print_message(message: &Message) {
    let status = match message.status {
        MessageStatus::Failed => format!(
            " [failed: {}, /retry {}]",
            message.failure_reason.as_deref().unwrap_or("unknown"),
            message.id
        ),
        MessageStatus::Sent | MessageStatus::Delivered | MessageStatus::Read => String::new(),
        pending => format!(" [{}]", pending.as_str()),
    };
    println!(
        "  {} {}: {}{}",
        message.timestamp.format("%H:%M:%S"),
        message.sender.display_name(),
        message.content,
        status
    );
}

/// Print what changed in the open conversation while the prompt waits
async fn print_events(sessions: SessionManager, current: watch::Receiver<Option<String>>) {
    let mut events = sessions.subscribe();
    let mut shown: HashMap<String, String> = HashMap::new();

    while let Some(event) = events.recv().await {
        let open = current.borrow().clone();
        match event {
            SessionEvent::MessagesChanged { conversation_id }
                if open.as_deref() == Some(conversation_id.as_str()) =>
            {
                let messages = sessions.messages(&conversation_id);
                let Some(latest) = messages.iter().rev().find(|message| !message.local_echo) else {
                    continue;
                };
                if shown.get(&conversation_id) == Some(&latest.id) {
                    continue;
                }
                shown.insert(conversation_id.clone(), latest.id.clone());
                if latest.sender.id != sessions.identity().id {
                    print_message(latest);
                }
            }
            SessionEvent::TypingChanged {
                conversation_id,
                participants,
            } if open.as_deref() == Some(conversation_id.as_str()) && !participants.is_empty() => {
                println!("  ({} typing)", participants.join(", "));
            }
            SessionEvent::ConnectionStateChanged { state } => {
                println!("  (connection {state})");
            }
            _ => {}
        }
    }
}
