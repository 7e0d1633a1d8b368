use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use mindful_chat::chat::ChatSession;
use mindful_chat::config::Config;
use mindful_chat::constants::DEFAULT_PORT;
use mindful_chat::message::{Sender, Session};
use mindful_chat::web_server;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

// Define the command-line interface structure using clap
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Directory holding the persisted chat session.
    #[arg(long, global = true, env = "MINDFUL_CHAT_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Base URL of the Ollama server.
    #[arg(long, global = true, env = "OLLAMA_URL")]
    ollama_url: Option<String>,

    /// Model used to generate feedback.
    #[arg(long, global = true, env = "MINDFUL_CHAT_MODEL")]
    model: Option<String>,

    /// Seconds to wait for feedback before giving up.
    #[arg(long, global = true, env = "MINDFUL_CHAT_TIMEOUT_SECS")]
    timeout_secs: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

// Define the available subcommands
#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Serve the Mindful Chat web UI.
    Serve {
        #[arg(long, default_value_t = DEFAULT_PORT, help = "Port for the web server.")]
        port: u16,
    },
    /// Chat in the terminal.
    Chat,
    /// Print the saved conversation.
    History,
    /// Delete the saved conversation.
    Clear,
}

impl Cli {
    fn config(&self) -> Config {
        let mut config = Config::default();
        if let Some(dir) = &self.data_dir {
            config.data_dir = dir.clone();
        }
        if let Some(url) = &self.ollama_url {
            config.ollama_url = url.clone();
        }
        if let Some(model) = &self.model {
            config.model = model.clone();
        }
        if let Some(secs) = self.timeout_secs {
            config.request_timeout = std::time::Duration::from_secs(secs);
        }
        config
    }
}

fn print_session(session: &Session) {
    if session.is_empty() {
        println!("No messages yet.");
        return;
    }
    for message in session {
        println!("{}: {}\n", message.sender, message.text);
    }
}

async fn run_chat(config: &Config) -> Result<()> {
    let store = config.open_store();
    let _watcher = store.spawn_watcher(config.sync_interval);
    store.subscribe(|session| {
        println!("\n(Conversation updated elsewhere, {} messages)", session.len());
    });
    let chat = ChatSession::new(store, config.feedback_client()?);

    print_session(&chat.snapshot().messages);
    println!("Type a message and press Enter. /clear starts over, /quit exits.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("Failed to read input")? {
        match line.trim() {
            "" => continue,
            "/quit" | "/exit" => break,
            "/clear" => {
                chat.clear();
                println!("Chat cleared.");
                continue;
            }
            _ => {}
        }

        println!("Thinking...");
        let snapshot = chat.send(&line).await?;
        match (&snapshot.error, snapshot.messages.last()) {
            (Some(error), _) => println!("{}", error),
            (None, Some(reply)) if reply.sender == Sender::Ai => println!("{}: {}\n", reply.sender, reply.text),
            _ => {}
        }
    }
    Ok(())
}

// The main entry point of the application, using tokio's async runtime
#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (for OLLAMA_URL, MINDFUL_CHAT_MODEL, ...)
    dotenvy::dotenv().ok();

    // Reads log level from RUST_LOG (e.g., RUST_LOG=info,mindful_chat=debug)
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = cli.config();
    info!("Mindful Chat starting with command: {:?}", cli.command);

    match cli.command {
        Commands::Serve { port } => {
            let store = config.open_store();
            let _watcher = store.spawn_watcher(config.sync_interval);
            let chat = Arc::new(ChatSession::new(store, config.feedback_client()?));
            web_server::start_web_server(port, chat, &config.templates_dir, &config.static_dir)
                .await?;
            info!("Mindful Chat stopped.");
        }
        Commands::Chat => run_chat(&config).await?,
        Commands::History => print_session(&config.open_store().current()),
        Commands::Clear => {
            config.open_store().set_session(Session::new());
            println!("Chat history cleared.");
        }
    }

    Ok(())
}
