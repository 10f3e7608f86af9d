use anyhow::Result;
use serde::{Deserialize, Serialize};

use super::database::Database;
use crate::config::{storage_keys, DEFAULT_MODEL};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppSettings {
    pub selected_model: String,
    /// Ask the backend to retrieve related memories with each request.
    pub context_plus_enabled: bool,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            selected_model: DEFAULT_MODEL.to_string(),
            context_plus_enabled: false,
        }
    }
}

/// Each setting lives under its own key; missing or unreadable values fall
/// back to the defaults.
pub struct SettingsService;

impl SettingsService {
    pub async fn load(db: &Database) -> AppSettings {
        let defaults = AppSettings::default();

        let selected_model = match db.get_value(storage_keys::SELECTED_MODEL).await {
            Ok(Some(model)) if !model.trim().is_empty() => model,
            Ok(_) => defaults.selected_model,
            Err(e) => {
                tracing::warn!("Failed to read selected model: {}", e);
                defaults.selected_model
            }
        };

        let context_plus_enabled = match db.get_value(storage_keys::CONTEXT_PLUS).await {
            Ok(Some(flag)) => serde_json::from_str(&flag).unwrap_or(defaults.context_plus_enabled),
            Ok(None) => defaults.context_plus_enabled,
            Err(e) => {
                tracing::warn!("Failed to read context-plus flag: {}", e);
                defaults.context_plus_enabled
            }
        };

        AppSettings {
            selected_model,
            context_plus_enabled,
        }
    }

    pub async fn save(db: &Database, settings: &AppSettings) -> Result<()> {
        db.set_values(vec![
            (
                storage_keys::SELECTED_MODEL.to_string(),
                settings.selected_model.clone(),
            ),
            (
                storage_keys::CONTEXT_PLUS.to_string(),
                serde_json::to_string(&settings.context_plus_enabled)?,
            ),
        ])
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_defaults_when_missing() {
        let db = Database::new_in_memory().unwrap();
        let settings = SettingsService::load(&db).await;
        assert_eq!(settings, AppSettings::default());
        assert_eq!(settings.selected_model, "deepseek-r1");
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let db = Database::new_in_memory().unwrap();
        let settings = AppSettings {
            selected_model: "gpt-4o".into(),
            context_plus_enabled: true,
        };
        SettingsService::save(&db, &settings).await.unwrap();
        assert_eq!(SettingsService::load(&db).await, settings);
        assert_eq!(
            db.get_value(storage_keys::CONTEXT_PLUS).await.unwrap().as_deref(),
            Some("true")
        );
    }

    #[tokio::test]
    async fn test_garbage_flag_falls_back() {
        let db = Database::new_in_memory().unwrap();
        db.set_value(storage_keys::CONTEXT_PLUS, "yes please").await.unwrap();
        assert!(!SettingsService::load(&db).await.context_plus_enabled);
    }
}
