use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use parley_core::auth::SessionCredentials;
use parley_core::{telemetry, ChannelRouter, ChatDirectory, ChatSession, MockBackend, SessionUpdate};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;
use tokio::time::timeout;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "xtask", version, about = "Automation helpers for Parley")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a chat, send a message and wait for the reply on the mock backend.
    Smoke,
}

fn main() -> Result<()> {
    telemetry::init_tracing(EnvFilter::new("info"))?;
    let cli = Cli::parse();

    match cli.command {
        Commands::Smoke => smoke_test(),
    }
}

fn smoke_test() -> Result<()> {
    let runtime = Runtime::new()?;
    runtime.block_on(async {
        let backend = MockBackend::new();
        let credentials = SessionCredentials::with_token("smoke");
        let router = ChannelRouter::mock(backend, Arc::new(credentials.clone()));
        let directory = ChatDirectory::new(router.clone());
        let mut session = ChatSession::new(router);

        let chat = directory.create("Smoke", Uuid::new_v4()).await?;
        session.open_chat(chat.id).await;
        session.send_local("ping from xtask").await?;

        let replied = timeout(Duration::from_secs(5), async {
            while session.messages().len() < 2 {
                if let SessionUpdate::Error(err) = session.next_update().await {
                    return Err(err);
                }
            }
            Ok(())
        })
        .await;
        match replied {
            Ok(Ok(())) => {}
            Ok(Err(err)) => bail!("smoke conversation failed: {err}"),
            Err(_) => bail!("no assistant reply within 5s"),
        }

        directory.delete(chat.id).await?;
        session.chat_deleted(chat.id).await;
        info!(
            "messages" = 2,
            "sign_outs" = credentials.sign_out_count(),
            "smoke test conversation completed"
        );
        Ok::<(), anyhow::Error>(())
    })
}
