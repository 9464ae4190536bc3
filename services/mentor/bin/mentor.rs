//! Main Entrypoint for the Mr. M Terminal Client
//!
//! This binary is responsible for:
//! 1. Parsing the command line.
//! 2. Loading configuration from the environment.
//! 3. Initializing logging on stderr.
//! 4. Building the provider client and restoring the stored session.
//! 5. Running the requested command.

use anyhow::Context;
use async_openai::config::OpenAIConfig;
use clap::{Parser, Subcommand};
use mentor_core::{
    Mentor,
    curriculum::filter_by_category,
    gemini_client::GeminiClient,
    llm_client::{MentorClient, OpenAICompatibleClient},
    models::AcademicMode,
    profile::RefreshPolicy,
    storage::{FileStore, SessionStore},
};
use mentor_service::{
    config::{Config, Provider},
    display::{format_message, format_quiz, format_roadmap, print_events},
    repl::{self, load_image},
};
use std::{path::PathBuf, sync::Arc};
use tokio::sync::mpsc;
use tracing::info;

#[derive(Parser)]
#[command(version, about = "Mr. M, a commerce mentor in your terminal")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Interactive chat (the default)
    Chat {
        /// Start or switch to this track
        #[arg(long)]
        mode: Option<AcademicMode>,
    },
    /// Send one message and print the reply
    Ask {
        text: String,
        /// Attach an image
        #[arg(long)]
        image: Option<PathBuf>,
        #[arg(long)]
        mode: Option<AcademicMode>,
    },
    /// Print the curriculum of a track
    Curriculum {
        mode: AcademicMode,
        #[arg(long)]
        category: Option<String>,
    },
    /// Delete every stored session key
    Reset,
}

fn build_client(config: &Config) -> anyhow::Result<Arc<dyn MentorClient>> {
    match config.provider {
        Provider::Gemini => {
            info!("Using Gemini provider.");
            let api_key = config
                .gemini_api_key
                .clone()
                .context("GEMINI_API_KEY is not set")?;
            Ok(Arc::new(GeminiClient::new(api_key, config.models())))
        }
        Provider::OpenAI => {
            info!("Using OpenAI provider.");
            let api_key = config
                .openai_api_key
                .as_ref()
                .context("OPENAI_API_KEY is not set")?;
            let openai_config = OpenAIConfig::new()
                .with_api_key(api_key)
                .with_api_base(&config.openai_base_url);
            Ok(Arc::new(OpenAICompatibleClient::new(
                openai_config,
                config.models(),
            )))
        }
    }
}

async fn ask(
    mentor: &Mentor,
    text: &str,
    image: Option<PathBuf>,
    mode: Option<AcademicMode>,
) -> anyhow::Result<()> {
    match (mode, mentor.mode().await) {
        (Some(requested), current) if current != Some(requested) => {
            mentor.select_mode(requested).await?
        }
        (None, None) => anyhow::bail!("No track selected. Pass --mode <11th|12th|BBA|MBA>."),
        _ => {}
    }
    let image = match image {
        Some(path) => Some(load_image(&path).await?),
        None => None,
    };
    let id = mentor.send(text, image, false).await?;
    let reply = mentor
        .message(id)
        .await
        .context("Reply disappeared from the conversation")?;
    println!("{}", format_message(&reply));
    for source in &reply.sources {
        println!("   🔗 {} <{}>", source.title, source.uri);
    }
    if let Some(quiz) = &reply.quiz {
        println!("{}", format_quiz(quiz));
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- 1. Parse the Command Line ---
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Chat { mode: None });
    if let Commands::Curriculum { mode, category } = &command {
        println!(
            "{}",
            format_roadmap(&filter_by_category(*mode, category.as_deref()))
        );
        return Ok(());
    }

    // --- 2. Load Configuration ---
    let config = Config::from_env().context("Failed to load configuration")?;

    // --- 3. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .with_writer(std::io::stderr)
        .init();
    info!(data_dir = %config.data_dir.display(), "Configuration loaded.");

    // --- 4. Build the Client and Restore the Session ---
    let store = SessionStore::new(Arc::new(FileStore::new(config.data_dir.clone())));
    if let Commands::Reset = command {
        store.clear().await?;
        println!("All session data cleared.");
        return Ok(());
    }
    let client = build_client(&config)?;
    info!(
        provider = ?config.provider,
        model = %config.chat_model,
        "Service configured."
    );

    // --- 5. Run ---
    match command {
        Commands::Ask { text, image, mode } => {
            let mentor = Mentor::load(client, store, None, RefreshPolicy::default()).await?;
            ask(&mentor, &text, image, mode).await?;
        }
        Commands::Chat { mode } => {
            let (tx, rx) = mpsc::unbounded_channel();
            let printer = tokio::spawn(print_events(rx));
            let mentor =
                Mentor::load(client, store, Some(tx), RefreshPolicy::default()).await?;
            repl::run(&mentor, &config, mode).await?;
            drop(mentor);
            printer.abort();
        }
        Commands::Curriculum { .. } | Commands::Reset => {}
    }
    Ok(())
}
