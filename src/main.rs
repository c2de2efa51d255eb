use clap::Parser;
use colloquy::client::{ProviderClient, ProviderConfig};
use colloquy::constants::{
    DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_REQUEST_TIMEOUT_SECS, MAX_RETRIES,
};
use colloquy::consumer::{StreamConsumer, TurnOutcome};
use colloquy::history::{ConversationSummary, HistoryCache};
use colloquy::session::SessionStore;
use colloquy::types::{FileAttachment, SessionId, StreamEvent};
use colored::Colorize;
use std::io::Write;
use std::time::Duration;
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Upstream provider endpoint.
    #[arg(long, default_value = "https://api.dify.ai/v1")]
    base_url: String,
    /// User identifier sent with every upstream request.
    #[arg(long, default_value = "portal-cli")]
    user: String,
    #[arg(long, default_value_t = DEFAULT_REQUEST_TIMEOUT_SECS)]
    request_timeout_secs: u64,
    #[arg(long, default_value_t = DEFAULT_CONNECT_TIMEOUT_SECS)]
    connect_timeout_secs: u64,
    #[arg(long, default_value_t = MAX_RETRIES)]
    max_retries: u32,
    #[arg(long, default_value = "colloquy.log")]
    log_file: String,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let file_appender = tracing_appender::rolling::never(".", &args.log_file);
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false),
        )
        .with(tracing_error::ErrorLayer::default())
        .init();
    colloquy::logging::setup_panic_hook();

    let api_key = match std::env::var("DIFY_API_KEY") {
        Ok(k) if !k.is_empty() => k,
        _ => {
            eprintln!("Error: DIFY_API_KEY environment variable is missing or empty.");
            eprintln!("Please set it in your .env file or environment.");
            std::process::exit(1);
        }
    };

    let mut config = ProviderConfig::new(args.base_url.clone(), api_key, args.user.clone());
    config.request_timeout = Duration::from_secs(args.request_timeout_secs);
    config.connect_timeout = Duration::from_secs(args.connect_timeout_secs);
    config.max_retries = args.max_retries;

    let client = match ProviderClient::new(config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to initialize provider client: {}", e.inner);
            std::process::exit(1);
        }
    };

    let (tx_events, rx_events) = mpsc::channel::<StreamEvent>(64);
    spawn_event_printer(rx_events);

    let mut consumer = StreamConsumer::with_event_sink(tx_events);
    let mut store = SessionStore::new();
    let mut history = HistoryCache::new(client.clone());
    let mut listed: Vec<ConversationSummary> = Vec::new();

    println!("{}", "colloquy — streaming chat portal CLI".bold());
    println!("Commands: /new, /history [more|refresh], /open <n>, /delete <n>, /retry, /quit");

    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();

    loop {
        print!("{} ", ">".cyan());
        let _ = std::io::stdout().flush();

        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                eprintln!("stdin error: {}", e);
                break;
            }
        };
        let input = line.trim();
        if input.is_empty() {
            continue;
        }

        match input.split_whitespace().collect::<Vec<_>>().as_slice() {
            ["/quit"] | ["/exit"] => break,
            ["/new"] => {
                store.create("New conversation");
                println!("Started a new conversation.");
            }
            ["/history"] => {
                listed = list_history(&mut history, false, false).await;
            }
            ["/history", "refresh"] => {
                listed = list_history(&mut history, true, false).await;
            }
            ["/history", "more"] => {
                listed = list_history(&mut history, false, true).await;
            }
            ["/open", index] => {
                open_history_entry(&mut store, &mut history, &listed, index).await;
            }
            ["/delete", index] => {
                delete_history_entry(&client, &mut store, &mut history, &mut listed, index).await;
            }
            ["/retry"] => match consumer.take_resend() {
                Some(request) => {
                    let session_id = ensure_active_session(&mut store, &request.prompt);
                    if let Some(session) = store.get_mut(session_id) {
                        run_turn(
                            &mut consumer,
                            &client,
                            session,
                            request.prompt,
                            request.files,
                        )
                        .await;
                    }
                }
                None => println!("Nothing to retry."),
            },
            _ => {
                let prompt = input.to_string();
                let session_id = ensure_active_session(&mut store, &prompt);
                if let Some(session) = store.get_mut(session_id) {
                    run_turn(&mut consumer, &client, session, prompt, Vec::new()).await;
                }
            }
        }
    }

    println!("bye");
}

fn spawn_event_printer(mut rx: mpsc::Receiver<StreamEvent>) {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                StreamEvent::Content { delta, .. } => {
                    print!("{}", delta);
                    let _ = std::io::stdout().flush();
                }
                StreamEvent::Thinking { delta, .. } => {
                    print!("{}", delta.dimmed());
                    let _ = std::io::stdout().flush();
                }
                StreamEvent::File { attachment, .. } => {
                    println!();
                    println!(
                        "{}",
                        format!(
                            "[file] {} ({})",
                            attachment.name,
                            attachment.source.url().unwrap_or("uploaded")
                        )
                        .yellow()
                    );
                }
                StreamEvent::Complete { attachments, .. } => {
                    for attachment in &attachments {
                        if let Some(url) = attachment.source.url() {
                            println!();
                            println!("{}", format!("[file] {} ({})", attachment.name, url).yellow());
                        }
                    }
                    println!();
                }
                StreamEvent::Error { message, .. } => {
                    println!();
                    println!("{}", format!("[error] {}", message).red());
                }
            }
        }
    });
}

fn ensure_active_session(store: &mut SessionStore, prompt: &str) -> SessionId {
    match store.active_id() {
        Some(id) => id,
        None => store.create(colloquy::session::Session::title_from_prompt(prompt)),
    }
}

async fn run_turn(
    consumer: &mut StreamConsumer,
    client: &ProviderClient,
    session: &mut colloquy::session::Session,
    prompt: String,
    files: Vec<FileAttachment>,
) {
    let token = consumer.cancel_token();
    let turn = consumer.send_turn(client, session, prompt, files);
    tokio::pin!(turn);

    let outcome = loop {
        tokio::select! {
            res = &mut turn => break res,
            _ = tokio::signal::ctrl_c() => {
                eprintln!("{}", "\ncancelling…".yellow());
                token.cancel();
            }
        }
    };

    match outcome {
        Ok(TurnOutcome::Complete { cancelled }) => {
            if cancelled {
                println!("{}", "Turn stopped.".yellow());
            }
        }
        Ok(TurnOutcome::Error { message }) => {
            println!(
                "{}",
                format!("Turn failed: {} (/retry to resend)", message).red()
            );
        }
        Err(e) => {
            println!("{}", format!("Could not start turn: {}", e.inner).red());
        }
    }
}

async fn list_history(
    history: &mut HistoryCache<ProviderClient>,
    force_refresh: bool,
    load_more: bool,
) -> Vec<ConversationSummary> {
    match history.list_conversations(force_refresh, load_more).await {
        Ok(conversations) => {
            if conversations.is_empty() {
                println!("No conversations upstream.");
            }
            for (i, summary) in conversations.iter().enumerate() {
                println!("{:>3}. {} ({})", i + 1, summary.name, summary.id.short());
            }
            if history.has_more() {
                println!("{}", "(/history more for older conversations)".dimmed());
            }
            conversations
        }
        Err(e) => {
            println!("{}", format!("History unavailable: {}", e.inner.user_message()).red());
            Vec::new()
        }
    }
}

async fn open_history_entry(
    store: &mut SessionStore,
    history: &mut HistoryCache<ProviderClient>,
    listed: &[ConversationSummary],
    index: &str,
) {
    let summary = match listed_entry(listed, index) {
        Some(s) => s,
        None => return,
    };

    // A conversation already materialized as a session is never re-fetched.
    if let Some(existing) = store.find_by_conversation(&summary.id) {
        let id = existing.id;
        store.set_active(id);
        println!("Switched to \"{}\".", summary.name);
        return;
    }

    match history.load_messages(&summary.id).await {
        Ok(messages) => {
            store.open_history(summary, &messages);
            println!("Opened \"{}\" ({} messages).", summary.name, messages.len() * 2);
        }
        Err(e) => {
            println!(
                "{}",
                format!("Could not load conversation: {}", e.inner.user_message()).red()
            );
        }
    }
}

async fn delete_history_entry(
    client: &ProviderClient,
    store: &mut SessionStore,
    history: &mut HistoryCache<ProviderClient>,
    listed: &mut Vec<ConversationSummary>,
    index: &str,
) {
    let summary = match listed_entry(listed, index) {
        Some(s) => s.clone(),
        None => return,
    };

    match client.delete_conversation(&summary.id).await {
        Ok(()) => {
            if let Some(session) = store.find_by_conversation(&summary.id) {
                let id = session.id;
                store.remove(id);
            }
            history.invalidate_conversation(&summary.id);
            listed.retain(|s| s.id != summary.id);
            println!("Deleted \"{}\".", summary.name);
        }
        Err(e) => {
            println!(
                "{}",
                format!("Could not delete conversation: {}", e.inner.user_message()).red()
            );
        }
    }
}

fn listed_entry<'a>(listed: &'a [ConversationSummary], index: &str) -> Option<&'a ConversationSummary> {
    let idx: usize = match index.parse() {
        Ok(n) => n,
        Err(_) => {
            println!("Expected a number from the last /history listing.");
            return None;
        }
    };
    match idx.checked_sub(1).and_then(|i| listed.get(i)) {
        Some(summary) => Some(summary),
        None => {
            println!("No such entry; run /history first.");
            None
        }
    }
}
