use crate::api::{self, ApiConfig};
use crate::auth::{AuthConfig, AuthService};
use crate::cli::actions::Action;
use crate::mfa::{CodeSender, LogCodeSender, MfaConfig, MfaController};
use crate::oauth::OAuthExchanger;
use crate::policy::SecurityPolicyEvaluator;
use crate::session::SessionManager;
use crate::store::{CredentialStore, MemoryStore, PgStore};
use anyhow::Result;
use std::sync::Arc;
use tracing::warn;

/// Handle the server action
pub async fn handle(action: Action) -> Result<()> {
    match action {
        Action::Server {
            port,
            dsn,
            base_url,
            production,
        } => {
            let store: Arc<dyn CredentialStore> = if dsn == "memory://" {
                warn!("In-memory credential store, data is lost on restart");
                Arc::new(MemoryStore::new())
            } else {
                Arc::new(PgStore::connect(&dsn).await?)
            };

            let policy = SecurityPolicyEvaluator::new(Arc::clone(&store));
            let sessions = SessionManager::new(Arc::clone(&store), policy.clone());
            let sender: Arc<dyn CodeSender> = Arc::new(LogCodeSender);

            let mfa = Arc::new(MfaController::new(
                Arc::clone(&store),
                policy.clone(),
                sessions.clone(),
                Arc::clone(&sender),
                MfaConfig::new("custodia"),
            ));

            let oauth = Arc::new(OAuthExchanger::new());

            let auth = Arc::new(AuthService::new(
                store,
                policy,
                sessions,
                mfa,
                oauth,
                sender,
                AuthConfig::new(base_url),
            ));

            api::serve(port, auth, ApiConfig { production }).await?;
        }
    }

    Ok(())
}
