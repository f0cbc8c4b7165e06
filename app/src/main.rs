use anyhow::Context;
use clap::{Parser, Subcommand};
use parley::{render, ParleyApp};
use parley_core::config::ClientSettings;
use parley_core::telemetry;
use std::path::PathBuf;
use tokio::io::BufReader;
use tokio::runtime::Runtime;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "parley", version, about = "Terminal client for Parley chats")]
struct Cli {
    #[command(subcommand)]
    command: Command,
    /// Read settings from this file instead of the default locations.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Use the in-process mock backend.
    #[arg(long, global = true)]
    mock: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List chats, most recently updated first.
    Chats {
        /// Keep refreshing at the configured poll interval.
        #[arg(long)]
        watch: bool,
    },
    /// Create a chat and print its id.
    New {
        #[arg(long, default_value = "")]
        title: String,
    },
    Delete { chat_id: Uuid },
    /// Open a chat and talk in it. Without an id a new chat is created.
    Open { chat_id: Option<Uuid> },
}

fn main() -> anyhow::Result<()> {
    telemetry::init_tracing(telemetry::env_filter())?;
    let cli = Cli::parse();

    let settings = if cli.mock {
        ClientSettings::mock()
    } else {
        let loaded = match &cli.config {
            Some(path) => ClientSettings::load_from(path),
            None => ClientSettings::load(),
        };
        loaded.map_err(|err| anyhow::anyhow!(err.user_message()))?
    };

    let runtime = Runtime::new()?;
    runtime.block_on(run(cli.command, settings))
}

async fn run(command: Command, settings: ClientSettings) -> anyhow::Result<()> {
    let mut app = ParleyApp::from_settings(settings)?;
    let mut stdout = std::io::stdout();

    match command {
        Command::Chats { watch: false } => {
            for line in render::chat_list(&app.list_chats().await?) {
                println!("{line}");
            }
        }
        Command::Chats { watch: true } => app.watch_chats(&mut stdout, None).await?,
        Command::New { title } => println!("{}", app.new_chat(&title).await?),
        Command::Delete { chat_id } => {
            if !app.delete_chat(chat_id).await? {
                println!("No chat with id {chat_id}.");
            }
        }
        Command::Open { chat_id } => {
            let chat_id = match chat_id {
                Some(id) => id,
                None => app.new_chat("").await.context("failed to create a chat")?,
            };
            println!("Chat {chat_id}. Type /quit to leave, /delete to remove the chat.");
            let stdin = BufReader::new(tokio::io::stdin());
            app.run_conversation(chat_id, stdin, &mut stdout).await?;
        }
    }

    Ok(())
}
