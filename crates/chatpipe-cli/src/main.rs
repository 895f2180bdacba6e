//! chatpipe - stream chat responses and server notifications

mod config;

use std::io::Write;

use chatpipe_session::{EventService, Notification, TrainingNotification};
use chatpipe_stream::{ChatClient, InteractionRecord, StreamEvent};
use clap::{CommandFactory, Parser, Subcommand};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// chatpipe - streaming chat client
#[derive(Parser, Debug)]
#[command(name = "chatpipe")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Server base URL (overrides CHATPIPE_SERVER and the config file)
    #[arg(short, long, global = true)]
    server: Option<String>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Initialize config file
    #[arg(long)]
    init_config: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send one prompt and stream the answer
    Chat {
        prompt: String,

        /// Model version to ask for
        #[arg(long)]
        version: Option<String>,

        /// Print every event as one JSON line
        #[arg(long)]
        json: bool,
    },

    /// Print server notifications until Ctrl-C
    Watch {
        /// Reason to hold the connection for
        #[arg(long, default_value = chatpipe_session::reasons::SAMPLES)]
        reason: String,

        /// Print every notification as one JSON line
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Logs go to stderr; stdout carries only output
    let default_filter = if args.verbose {
        "chatpipe=debug,chatpipe_stream=debug,chatpipe_session=debug"
    } else {
        "chatpipe=info,chatpipe_stream=info,chatpipe_session=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .with_writer(std::io::stderr)
        .init();

    // Initialize config and exit
    if args.init_config {
        match config::Config::init() {
            Ok(path) => {
                println!("Config file created at: {}", path.display());
                println!("\nExample config:\n{}", config::example_config());
            }
            Err(e) => {
                eprintln!("Error creating config: {}", e);
                std::process::exit(1);
            }
        }
        return Ok(());
    }

    let cfg = config::Config::load();
    let server = cfg.server(args.server.as_deref());

    match args.command {
        Some(Command::Chat { prompt, version, json }) => {
            let version = cfg.version(version.as_deref());
            let client = ChatClient::http(cfg.client_config(&server))?;
            if !run_chat(&client, prompt, version, json).await? {
                std::process::exit(1);
            }
        }
        Some(Command::Watch { reason, json }) => {
            run_watch(EventService::new(cfg.event_config(&server))?, reason, json).await?;
        }
        None => {
            Args::command().print_help()?;
        }
    }

    Ok(())
}

/// Cancel `token` on Ctrl-C
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            token.cancel();
        }
    });
}

/// Stream one prompt. Returns whether it completed.
async fn run_chat(client: &ChatClient, prompt: String, version: String, json: bool) -> anyhow::Result<bool> {
    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let mut events = client.send_message_with_cancel(prompt, version, cancel);
    let mut shown = String::new();
    let mut completed = false;
    let mut stdout = std::io::stdout();

    while let Some(event) = events.next().await {
        if json {
            println!("{}", serde_json::to_string(&event)?);
            completed |= matches!(event, StreamEvent::Complete { .. });
            continue;
        }

        match event {
            StreamEvent::Stream { content, .. } => {
                show(&mut stdout, &mut shown, &content)?;
            }
            StreamEvent::Progress {
                content,
                retrying: true,
                ..
            } => {
                eprintln!("[{}]", content);
            }
            StreamEvent::Progress { inactive_time, .. } => {
                let waited = inactive_time.unwrap_or_default() / 1000;
                eprintln!("[Still waiting for the server ({}s without data)]", waited);
            }
            StreamEvent::Complete {
                content,
                debug,
                parse_error,
                ..
            } => {
                show(&mut stdout, &mut shown, &content)?;
                println!();
                if let Some(record) = debug {
                    eprintln!("{}", summary(&record));
                }
                if let Some(e) = parse_error {
                    eprintln!("[Record rebuilt from streamed text: {}]", e);
                }
                completed = true;
            }
            StreamEvent::Error { message, timeout, .. } => {
                if !shown.is_empty() {
                    println!();
                }
                if timeout {
                    eprintln!("Error (timed out): {}", message);
                } else {
                    eprintln!("Error: {}", message);
                }
            }
            StreamEvent::Done => {}
        }
    }

    Ok(completed)
}

/// Print the part of `content` not yet on screen
fn show(out: &mut impl Write, shown: &mut String, content: &str) -> std::io::Result<()> {
    match content.strip_prefix(shown.as_str()) {
        Some(rest) => write!(out, "{}", rest)?,
        // The server rewrote earlier text; start over on a fresh line
        None => write!(out, "\n{}", content)?,
    }
    shown.clear();
    shown.push_str(content);
    out.flush()
}

fn summary(record: &InteractionRecord) -> String {
    format!(
        "[{} {} | {} ms | tokens {} prompt / {} completion / {} total | {} recall methods]",
        record.model,
        record.version,
        record.processing_time,
        record.tokens.prompt,
        record.tokens.completion,
        record.tokens.total,
        record.recall_methods.len()
    )
}

enum Received {
    General(Notification),
    Training(TrainingNotification),
}

async fn run_watch(service: EventService, reason: String, json: bool) -> anyhow::Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let general = tx.clone();
    let _general = service.subscribe(move |n| {
        let _ = general.send(Received::General(n.clone()));
    });
    let _training = service.subscribe_training(move |n| {
        let _ = tx.send(Received::Training(n.clone()));
    });

    service.connect_for(reason.as_str());
    eprintln!("Watching {} (Ctrl-C to stop)", service.config().events_url);

    loop {
        let received = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            received = rx.recv() => received,
        };
        // Subscribers are dropped when the service closes itself
        let Some(received) = received else {
            break;
        };

        let lost = matches!(received, Received::General(Notification::ConnectionLost { .. }));
        match (&received, json) {
            (Received::General(n), true) => println!("{}", serde_json::to_string(n)?),
            (Received::Training(n), true) => println!("{}", serde_json::to_string(n)?),
            (Received::General(n), false) => println!("{}", describe(n)),
            (Received::Training(n), false) => println!("{}", describe_training(n)),
        }
        if lost {
            break;
        }
    }

    service.close();
    Ok(())
}

fn describe(notification: &Notification) -> String {
    match notification {
        Notification::VersionUpdate(notice) => {
            if notice.description.is_empty() {
                notice.summary()
            } else {
                format!("{} ({})", notice.summary(), notice.description)
            }
        }
        Notification::Chat(StreamEvent::Complete { content, .. }) => format!("chat complete: {}", content),
        Notification::Chat(event) => format!("chat: {}", event.content().unwrap_or("[done]")),
        Notification::ServerError { message } => format!("server error: {}", message),
        Notification::ConnectionLost { attempts } => {
            format!("connection lost after {} reconnect attempts", attempts)
        }
    }
}

fn describe_training(notification: &TrainingNotification) -> String {
    match notification {
        TrainingNotification::Status { status, message } => {
            format!("training {}: {}", status.as_deref().unwrap_or("?"), message)
        }
        TrainingNotification::OptimizationStatus {
            task_id,
            status,
            progress,
            message,
        } => format!(
            "optimization {} {} {}: {}",
            task_id.as_ref().map(|t| t.to_string()).unwrap_or_default(),
            status.as_deref().unwrap_or("?"),
            progress.map(|p| format!("{:.0}%", p * 100.0)).unwrap_or_default(),
            message
        ),
        TrainingNotification::OptimizationCreated(task) => format!("optimization created: {}", task),
        TrainingNotification::Completed { error: Some(e), .. } => format!("training failed: {}", e),
        TrainingNotification::Completed { .. } => "training completed".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_show_prints_only_new_text() {
        let mut out = Vec::new();
        let mut shown = String::new();
        show(&mut out, &mut shown, "Hel").unwrap();
        show(&mut out, &mut shown, "Hello").unwrap();
        show(&mut out, &mut shown, "Hello").unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "Hello");
        assert_eq!(shown, "Hello");
    }

    #[test]
    fn test_show_restarts_on_rewrite() {
        let mut out = Vec::new();
        let mut shown = String::new();
        show(&mut out, &mut shown, "draft").unwrap();
        show(&mut out, &mut shown, "final").unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "draft\nfinal");
    }

    #[test]
    fn test_args_parse_subcommands() {
        let args = Args::parse_from(["chatpipe", "chat", "hello", "--version", "2.0.0", "--json", "-s", "http://x"]);
        assert_eq!(args.server.as_deref(), Some("http://x"));
        match args.command {
            Some(Command::Chat { prompt, version, json }) => {
                assert_eq!(prompt, "hello");
                assert_eq!(version.as_deref(), Some("2.0.0"));
                assert!(json);
            }
            other => panic!("expected chat, got {:?}", other),
        }

        let args = Args::parse_from(["chatpipe", "watch"]);
        assert!(matches!(args.command, Some(Command::Watch { reason, json: false }) if reason == "samples"));
    }

    #[test]
    fn test_describe_training_failure() {
        let text = describe_training(&TrainingNotification::Completed {
            version: None,
            error: Some("oom".into()),
        });
        assert_eq!(text, "training failed: oom");
    }
}
