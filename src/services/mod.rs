pub mod auth;
pub mod branch;
pub mod chat;
pub mod context;
pub mod database;
pub mod export;
pub mod files;
pub mod history;
pub mod markdown;
pub mod search;
pub mod settings;
pub mod store;
pub mod sync;
pub mod view;

pub use auth::AuthService;
pub use branch::{BranchError, Visibility};
pub use chat::{ChatError, ChatService, ChatSession};
pub use database::Database;
pub use files::FileStore;
pub use history::{HistoryService, RetentionReport};
pub use settings::{AppSettings, SettingsService};
pub use store::HistoryStore;
pub use sync::SyncService;
