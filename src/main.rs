use std::io::Write;
use std::path::PathBuf;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use palaver::core::config::Config;
use palaver::core::session::{ConfirmationOutcome, SessionRouter};
use palaver::core::turn::{TurnDriver, TurnEvent};

#[derive(Parser)]
#[command(name = "palaver")]
#[command(about = "A chat agent with human-in-the-loop tool confirmation")]
#[command(
    long_about = "Palaver connects a line-oriented chat loop to an OpenAI-compatible model \
API and a remote MCP tool server. Tools listed under tools_requiring_confirmation in the \
config are held for explicit approval before they execute.\n\n\
Commands inside the chat:\n\
  /user <name>      Switch to (or create) another user's session\n\
  /quit             Exit\n\
  y / n             Approve or reject a pending tool call"
)]
struct Args {
    /// Path to a config file (defaults to the platform config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// User whose session to start in
    #[arg(short, long, default_value = "default")]
    user: String,

    /// Override the configured model
    #[arg(short, long)]
    model: Option<String>,

    /// Override the configured tool server URL
    #[arg(long)]
    tool_server: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load()?,
    };
    if let Some(model) = args.model {
        config.provider.model = model;
    }
    if let Some(tool_server) = args.tool_server {
        config.tool_server.base_url = tool_server;
    }

    let driver = TurnDriver::from_config(&config)?;
    let mut router = SessionRouter::default();
    let mut current_user = args.user;

    println!(
        "palaver: chatting as '{current_user}' (model: {})",
        config.provider.model
    );
    println!("Type a message, /user <name> to switch users, /quit to exit.");

    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();

    loop {
        print_prompt(&mut router, &current_user);

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }
        if line == "/quit" {
            break;
        }
        if let Some(name) = line.strip_prefix("/user ") {
            let name = name.trim();
            if name.is_empty() {
                println!("Usage: /user <name>");
            } else {
                current_user = name.to_string();
                println!("Now chatting as '{current_user}'.");
            }
            continue;
        }

        let session = router.session_for(&current_user);

        if session.has_pending_confirmations() {
            let Some(outcome) = parse_confirmation(&line) else {
                println!("A tool call is awaiting confirmation. Reply y to approve or n to reject.");
                continue;
            };
            let invocation_id = session.pending_confirmations()[0].id.clone();
            session.resolve(invocation_id, outcome);
        } else {
            session.push_user_message(line);
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let printer = async {
            while let Some(event) = rx.recv().await {
                render_event(event);
            }
        };

        let drive_and_print = async {
            tokio::join!(driver.drive_turn(session, tx, cancel.clone()), printer);
        };
        tokio::pin!(drive_and_print);

        tokio::select! {
            _ = &mut drive_and_print => {}
            _ = tokio::signal::ctrl_c() => {
                cancel.cancel();
                // Let the turn drain and release the tool-server connection.
                drive_and_print.await;
                println!("\n[turn cancelled]");
            }
        }
    }

    Ok(())
}

fn print_prompt(router: &mut SessionRouter, current_user: &str) {
    let session = router.session_for(current_user);
    for invocation in session.pending_confirmations() {
        println!(
            "[pending] {} {} approve? (y/n)",
            invocation.tool_name, invocation.raw_arguments
        );
    }
    print!("{current_user}> ");
    let _ = std::io::stdout().flush();
}

fn parse_confirmation(line: &str) -> Option<ConfirmationOutcome> {
    match line.to_ascii_lowercase().as_str() {
        "y" | "yes" => Some(ConfirmationOutcome::Approved),
        "n" | "no" => Some(ConfirmationOutcome::Rejected),
        _ => None,
    }
}

fn render_event(event: TurnEvent) {
    match event {
        TurnEvent::TextDelta(chunk) => {
            print!("{chunk}");
            let _ = std::io::stdout().flush();
        }
        TurnEvent::ToolResult {
            tool_name, result, ..
        } => {
            println!("\n[{tool_name}] {result}");
        }
        TurnEvent::ConfirmationRequired {
            tool_name,
            arguments,
            ..
        } => {
            let rendered = serde_json::Value::Object(arguments).to_string();
            println!("\n[confirm] {tool_name} {rendered}");
        }
        TurnEvent::Error(error) => {
            eprintln!("\n{error}");
        }
        TurnEvent::End => {
            println!();
        }
    }
}
