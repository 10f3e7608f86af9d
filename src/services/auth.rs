use anyhow::{Context, Result};

use super::database::Database;
use super::history::HistoryService;
use super::store::HistoryStore;
use crate::config::storage_keys;
use crate::models::{AuthState, AuthUser};

/// Persisted sign-in state. Issuing tokens happens elsewhere; this only keeps
/// what the sign-in flow handed over.
pub struct AuthService;

impl AuthService {
    pub async fn load(db: &Database) -> AuthState {
        let token = match db.get_value(storage_keys::TOKEN).await {
            Ok(token) => token.filter(|t| !t.is_empty()),
            Err(e) => {
                tracing::warn!("Failed to read auth token: {}", e);
                None
            }
        };

        let user = match db.get_value(storage_keys::USER).await {
            Ok(Some(json)) => match serde_json::from_str::<AuthUser>(&json) {
                Ok(user) => Some(user),
                Err(e) => {
                    tracing::warn!("Ignoring unreadable auth user: {}", e);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                tracing::warn!("Failed to read auth user: {}", e);
                None
            }
        };

        AuthState { token, user }
    }

    pub async fn store(db: &Database, token: &str, user: &AuthUser) -> Result<AuthState> {
        let user_json = serde_json::to_string(user).context("Failed to serialize auth user")?;
        db.set_values(vec![
            (storage_keys::TOKEN.to_string(), token.to_string()),
            (storage_keys::USER.to_string(), user_json),
        ])
        .await
        .context("Failed to store auth state")?;

        Ok(AuthState {
            token: Some(token.to_string()),
            user: Some(user.clone()),
        })
    }

    /// Forget the credentials and the local history that belonged to them.
    pub async fn sign_out(db: &Database, store: &mut HistoryStore) -> Result<()> {
        db.remove_values(&[storage_keys::TOKEN, storage_keys::USER])
            .await
            .context("Failed to remove auth state")?;
        HistoryService::clear(db, store).await?;
        db.delete_all_files().await.context("Failed to clear file store")?;
        tracing::info!("Signed out, local history cleared");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> AuthUser {
        AuthUser {
            id: Some(serde_json::json!(42)),
            email: Some("ada@example.com".into()),
            name: Some("Ada".into()),
        }
    }

    #[tokio::test]
    async fn test_unauthenticated_by_default() {
        let db = Database::new_in_memory().unwrap();
        let state = AuthService::load(&db).await;
        assert!(!state.is_authenticated());
        assert!(state.bearer().is_none());
    }

    #[tokio::test]
    async fn test_store_and_load() {
        let db = Database::new_in_memory().unwrap();
        AuthService::store(&db, "s3cr3t-bearer", &user()).await.unwrap();

        let state = AuthService::load(&db).await;
        assert!(state.is_authenticated());
        assert_eq!(state.bearer(), Some("s3cr3t-bearer"));
        assert!(!format!("{:?}", state).contains("s3cr3t-bearer"));
    }

    #[tokio::test]
    async fn test_token_without_user_is_not_authenticated() {
        let db = Database::new_in_memory().unwrap();
        db.set_value(storage_keys::TOKEN, "tok").await.unwrap();
        db.set_value(storage_keys::USER, "{broken").await.unwrap();
        assert!(!AuthService::load(&db).await.is_authenticated());
    }

    #[tokio::test]
    async fn test_sign_out_resets_history() {
        let db = Database::new_in_memory().unwrap();
        AuthService::store(&db, "tok", &user()).await.unwrap();
        let mut store = HistoryStore::new();
        store.new_conversation();
        HistoryService::save(&db, &store).await.unwrap();

        AuthService::sign_out(&db, &mut store).await.unwrap();
        assert!(store.is_empty());
        assert!(!AuthService::load(&db).await.is_authenticated());
        assert!(HistoryService::load(&db).await.is_empty());
    }
}
