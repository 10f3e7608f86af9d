use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use echo_history::config::Config;
use echo_history::models::{AuthUser, MessageKind};
use echo_history::remote::BackendClient;
use echo_history::services::export::export_to_markdown;
use echo_history::services::search::search;
use echo_history::services::view::project;
use echo_history::services::{
    AuthService, ChatService, ChatSession, Database, FileStore, HistoryService, HistoryStore,
    SettingsService, SyncService,
};

#[derive(Parser)]
#[command(
    name = "echo-history",
    about = "Versioned chat history for the Echo client",
    long_about = "Inspect, branch, sync and export locally stored Echo conversations."
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Database path override
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Backend base URL override
    #[arg(long, global = true)]
    backend: Option<String>,

    /// Enable debug logging
    #[arg(long, short = 'v', global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Command {
    /// List conversations, newest first
    List,

    /// Show the visible branch of a conversation
    Show { conversation: String },

    /// Display a specific version of a message
    Select {
        conversation: String,
        message: String,
        version: u32,
    },

    /// Send a message and wait for the reply
    Send {
        text: String,

        /// Continue this conversation instead of starting a new one
        #[arg(long)]
        conversation: Option<String>,
    },

    /// Record a new version of a user message
    Edit {
        conversation: String,
        message: String,
        text: String,

        /// Only record the edit, do not ask for a new reply
        #[arg(long)]
        local: bool,
    },

    /// Ask again for the reply to a message
    Regenerate { conversation: String, message: String },

    /// Search topics and visible messages
    Search {
        query: String,

        /// Also add matching conversations from the backend backup
        #[arg(long)]
        remote: bool,
    },

    /// Export the visible branch as markdown
    Export {
        conversation: String,

        /// Write to a file instead of stdout
        #[arg(long, short = 'o')]
        output: Option<PathBuf>,
    },

    /// Pull history from the backend
    Sync {
        /// Re-pull a single conversation
        #[arg(long)]
        conversation: Option<String>,

        /// Pull even when enough conversations are stored locally
        #[arg(long)]
        force: bool,
    },

    /// Fetch an attachment, locally or from the backend
    File {
        conversation: String,
        file: String,

        #[arg(long, short = 'o')]
        output: Option<PathBuf>,
    },

    /// Apply the retention limits now
    Retention,

    /// Remove all local history
    Clear,

    /// Store credentials handed over by the sign-in flow
    Login {
        token: String,

        #[arg(long)]
        email: Option<String>,

        #[arg(long)]
        name: Option<String>,
    },

    /// Forget credentials and local history
    Logout,

    /// Show or change settings
    Settings {
        #[arg(long)]
        model: Option<String>,

        #[arg(long)]
        context_plus: Option<bool>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Config::from_env()?.with_overrides(cli.backend.clone(), cli.db.clone());
    let db = Database::open(&config.db_path).await?;
    let mut store = HistoryService::load(&db).await;

    match cli.command {
        Command::List => {
            for summary in store.list_summaries() {
                let marker = if summary.trimmed { " (metadata only)" } else { "" };
                println!(
                    "{}  {}  {}{}",
                    summary.timestamp.format("%Y-%m-%d %H:%M"),
                    summary.id,
                    summary.topic,
                    marker
                );
                if let Some(preview) = &summary.last_message_preview {
                    println!("    {}", preview);
                }
            }
        }
        Command::Show { conversation } => {
            let conv = store.open_conversation(&conversation)?;
            println!("# {}\n", conv.topic);
            if conv.is_trimmed() {
                println!("Messages are not stored locally. Run `sync --conversation {}`.", conv.id);
            }
            for view in project(conv) {
                let who = match view.kind {
                    MessageKind::User => "you",
                    MessageKind::Ai => "ai",
                };
                println!(
                    "[{}] {} ({}/{})",
                    who, view.key, view.display_version, view.total_versions
                );
                println!("{}\n", view.text);
            }
        }
        Command::Select {
            conversation,
            message,
            version,
        } => {
            let visible = store.select_version(&conversation, &message, version)?;
            persist(&db, &mut store).await?;
            println!("{} messages visible", visible.len());
        }
        Command::Send { text, conversation } => {
            let id = match conversation {
                Some(id) => store.open_conversation(&id)?.id.clone(),
                None => store.new_conversation(),
            };
            let chat = chat_service(&db, &config).await?;
            let outcome = chat.send_message(&mut store, &id, &text, Vec::new()).await;
            persist(&db, &mut store).await?;
            println!("{}", outcome?.reply.text);
        }
        Command::Edit {
            conversation,
            message,
            text,
            local,
        } => {
            store.open_conversation(&conversation)?;
            if local {
                let (version, _) = store.record_edit(&conversation, &message, &text, Vec::new())?;
                persist(&db, &mut store).await?;
                println!("Recorded version {} of {}", version, message);
            } else {
                let chat = chat_service(&db, &config).await?;
                let outcome = chat
                    .resend_edit(&mut store, &conversation, &message, &text, Vec::new())
                    .await;
                persist(&db, &mut store).await?;
                println!("{}", outcome?.reply.text);
            }
        }
        Command::Regenerate {
            conversation,
            message,
        } => {
            store.open_conversation(&conversation)?;
            let chat = chat_service(&db, &config).await?;
            let outcome = chat.regenerate(&mut store, &conversation, &message).await;
            persist(&db, &mut store).await?;
            println!("{}", outcome?.reply.text);
        }
        Command::Search { query, remote } => {
            if remote {
                let auth = AuthService::load(&db).await;
                let client = BackendClient::new(&config.backend_url)?;
                let visible_count = store.len();
                let added = SyncService::pull_backup_search(
                    &mut store,
                    &auth,
                    &client,
                    &query,
                    visible_count,
                )
                .await?;
                if added > 0 {
                    persist(&db, &mut store).await?;
                }
            }
            for hit in search(&store, &query) {
                println!("{}  {}\n    {}", hit.conversation_id, hit.topic, hit.excerpt);
            }
        }
        Command::Export {
            conversation,
            output,
        } => {
            let markdown = export_to_markdown(store.conversation(&conversation)?);
            match output {
                Some(path) => std::fs::write(&path, markdown)
                    .with_context(|| format!("Failed to write {}", path.display()))?,
                None => print!("{}", markdown),
            }
        }
        Command::Sync {
            conversation,
            force,
        } => {
            let auth = AuthService::load(&db).await;
            if !auth.is_authenticated() {
                bail!("Not signed in. Run `login <token>` first.");
            }
            if conversation.is_none() && !force && !SyncService::needs_fallback(&store, &auth) {
                println!("{} conversations stored locally, nothing to pull", store.len());
                return Ok(());
            }
            let client = BackendClient::new(&config.backend_url)?;
            let report =
                SyncService::pull_history(&mut store, &auth, &client, conversation.as_deref())
                    .await?;
            persist(&db, &mut store).await?;
            println!(
                "Pulled {} conversations ({} messages), skipped {}",
                report.conversations, report.messages, report.skipped
            );
        }
        Command::File {
            conversation,
            file,
            output,
        } => {
            let auth = AuthService::load(&db).await;
            let client = BackendClient::new(&config.backend_url)?;
            let stored = FileStore::new(db.clone())
                .fetch(&conversation, &file, &client, auth.bearer())
                .await?;
            match output {
                Some(path) => std::fs::write(&path, &stored.data)
                    .with_context(|| format!("Failed to write {}", path.display()))?,
                None if stored.is_text() => print!("{}", String::from_utf8_lossy(&stored.data)),
                None => println!(
                    "{} ({}, {} bytes); use --output to save it",
                    stored.filename, stored.mime_type, stored.size
                ),
            }
        }
        Command::Retention => {
            let report = HistoryService::save_with_retention(&db, &mut store).await?;
            println!(
                "Evicted {}, trimmed {}",
                report.evicted.len(),
                report.trimmed.len()
            );
        }
        Command::Clear => {
            HistoryService::clear(&db, &mut store).await?;
            db.delete_all_files().await?;
            println!("Local history cleared");
        }
        Command::Login { token, email, name } => {
            let user = AuthUser {
                id: None,
                email,
                name,
            };
            AuthService::store(&db, &token, &user).await?;
            println!("Signed in");
        }
        Command::Logout => {
            AuthService::sign_out(&db, &mut store).await?;
            println!("Signed out");
        }
        Command::Settings {
            model,
            context_plus,
        } => {
            let mut settings = SettingsService::load(&db).await;
            if model.is_some() || context_plus.is_some() {
                if let Some(model) = model {
                    settings.selected_model = model;
                }
                if let Some(flag) = context_plus {
                    settings.context_plus_enabled = flag;
                }
                SettingsService::save(&db, &settings).await?;
            }
            println!("model: {}", settings.selected_model);
            println!("context plus: {}", settings.context_plus_enabled);
        }
    }

    Ok(())
}

async fn chat_service(db: &Database, config: &Config) -> Result<ChatService> {
    let client = BackendClient::new(&config.backend_url)?;
    Ok(ChatService::new(
        ChatSession::new(),
        Arc::new(client),
        SettingsService::load(db).await,
        AuthService::load(db).await,
    ))
}

/// Move large attachments out of line, then save under the retention limits.
async fn persist(db: &Database, store: &mut HistoryStore) -> Result<()> {
    let files = FileStore::new(db.clone());
    for conversation in store.conversations_mut().values_mut() {
        files.offload(conversation).await?;
    }
    let report = HistoryService::save_with_retention(db, store).await?;
    for id in &report.evicted {
        files.delete_conversation_files(id).await?;
    }
    Ok(())
}
