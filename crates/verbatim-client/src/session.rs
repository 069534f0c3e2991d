//! Session service: the single source of truth for who is signed in.
//!
//! The durable record lives in the local store under [`SESSION_KEY`]; this
//! service is the only writer. Everything else (views, guards, the channel
//! wiring in the shell) subscribes to the state watch and reacts.

use std::sync::Arc;

use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

use verbatim_api::{ApiClient, ApiError};
use verbatim_store::{LocalStore, SESSION_KEY};
use verbatim_types::api::{AuthResponse, LoginRequest, RegisterRequest};
use verbatim_types::models::Session;

use crate::error::ClientError;

#[derive(Debug, Clone, PartialEq)]
pub enum SessionState {
    /// Not yet resolved; the guard renders a loading state.
    Unknown,
    SignedOut,
    SignedIn(Session),
}

pub struct SessionService {
    api: Arc<ApiClient>,
    store: Arc<LocalStore>,
    state_tx: watch::Sender<SessionState>,
}

impl SessionService {
    /// Create the service and start listening for session changes made by
    /// other instances of the application.
    pub fn new(api: Arc<ApiClient>, store: Arc<LocalStore>) -> Arc<Self> {
        let (state_tx, _) = watch::channel(SessionState::Unknown);
        let service = Arc::new(Self {
            api,
            store,
            state_tx,
        });
        service.spawn_external_listener();
        service
    }

    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    pub fn current(&self) -> SessionState {
        self.state_tx.borrow().clone()
    }

    /// Resolve the stored session. The store is authoritative at every
    /// startup; corrupt or expired records are cleared and resolve to
    /// `SignedOut`, never an error.
    pub fn hydrate(&self) {
        let state = match self.read_stored() {
            Some(session) => {
                info!("Restored session for {} ({})", session.user.username, session.user.id);
                self.api.set_token(Some(session.token.clone()));
                SessionState::SignedIn(session)
            }
            None => {
                self.api.clear_token();
                SessionState::SignedOut
            }
        };
        self.state_tx.send_replace(state);
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<Session, ClientError> {
        let auth = self
            .api
            .login(&LoginRequest {
                email: email.to_string(),
                password: password.to_string(),
            })
            .await?;
        self.install(auth)
    }

    pub async fn register(&self, req: RegisterRequest) -> Result<Session, ClientError> {
        let auth = self.api.register(&req).await?;
        self.install(auth)
    }

    /// Re-read the profile behind the current token. Role and status can
    /// change mid-session (an assessment gets graded, a training fee
    /// clears); callers trigger this after any such flow.
    ///
    /// A 401 signs out locally; that is teardown, not an error.
    pub async fn refresh(&self) -> Result<(), ClientError> {
        let SessionState::SignedIn(mut session) = self.current() else {
            return Ok(());
        };

        match self.api.me().await {
            Ok(user) => {
                session.user = user;
                self.persist(&session)?;
                self.state_tx.send_replace(SessionState::SignedIn(session));
                Ok(())
            }
            Err(ApiError::Unauthorized) => {
                info!("Server rejected the session token, signing out");
                self.sign_out_local()
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn logout(&self) -> Result<(), ClientError> {
        info!("Signing out");
        self.sign_out_local()
    }

    fn install(&self, auth: AuthResponse) -> Result<Session, ClientError> {
        let session = Session {
            user: auth.user,
            token: auth.token,
        };
        self.persist(&session)?;
        self.api.set_token(Some(session.token.clone()));
        info!("Signed in as {} ({})", session.user.username, session.user.id);
        self.state_tx.send_replace(SessionState::SignedIn(session.clone()));
        Ok(session)
    }

    fn persist(&self, session: &Session) -> Result<(), ClientError> {
        let raw = serde_json::to_string(session).map_err(anyhow::Error::new)?;
        self.store.put(SESSION_KEY, &raw)?;
        Ok(())
    }

    fn sign_out_local(&self) -> Result<(), ClientError> {
        self.store.remove(SESSION_KEY)?;
        self.api.clear_token();
        self.state_tx.send_replace(SessionState::SignedOut);
        Ok(())
    }

    fn read_stored(&self) -> Option<Session> {
        let raw = match self.store.get(SESSION_KEY) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                warn!("Failed to read stored session: {}", e);
                return None;
            }
        };

        let session: Session = match serde_json::from_str(&raw) {
            Ok(session) => session,
            Err(e) => {
                warn!("Stored session is corrupt, clearing: {}", e);
                let _ = self.store.remove(SESSION_KEY);
                return None;
            }
        };

        if !token_usable(&session.token) {
            info!("Stored session token expired, clearing");
            let _ = self.store.remove(SESSION_KEY);
            return None;
        }

        Some(session)
    }

    /// Another instance of the application may sign in or out underneath
    /// us; the store broadcasts those writes and we re-read our state.
    fn spawn_external_listener(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let mut changes = self.store.changes();

        tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(key) if key == SESSION_KEY => {
                        let Some(service) = weak.upgrade() else { break };
                        info!("Session changed in another instance, re-reading");
                        service.hydrate();
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        let Some(service) = weak.upgrade() else { break };
                        service.hydrate();
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }
}

/// Peek at the token's `exp` without verifying the signature; validation is
/// the server's job, the client only avoids presenting something stale.
/// `Validation` requires the `exp` claim and checks it against the clock, so
/// the claims payload itself is not inspected further.
fn token_usable(token: &str) -> bool {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.insecure_disable_signature_validation();
    validation.validate_aud = false;

    jsonwebtoken::decode::<serde_json::Value>(token, &DecodingKey::from_secret(&[]), &validation)
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;
    use verbatim_types::models::{Role, UserProfile};

    fn mint_token(user_id: Uuid, ttl_secs: i64) -> String {
        let claims = serde_json::json!({
            "sub": user_id,
            "exp": (Utc::now() + chrono::Duration::seconds(ttl_secs)).timestamp(),
        });
        jsonwebtoken::encode(
            &jsonwebtoken::Header::default(),
            &claims,
            &jsonwebtoken::EncodingKey::from_secret(b"test-secret"),
        )
        .unwrap()
    }

    fn stored_session(ttl_secs: i64) -> Session {
        let id = Uuid::new_v4();
        Session {
            user: UserProfile {
                id,
                username: "dana".into(),
                email: "dana@verbatim.example".into(),
                role: Role::Client,
                assessment: None,
                training_paid: None,
            },
            token: mint_token(id, ttl_secs),
        }
    }

    fn service() -> (Arc<SessionService>, Arc<LocalStore>, Arc<ApiClient>) {
        let api = Arc::new(ApiClient::new("http://127.0.0.1:1"));
        let store = Arc::new(LocalStore::open_in_memory().unwrap());
        let service = SessionService::new(api.clone(), store.clone());
        (service, store, api)
    }

    #[tokio::test]
    async fn hydrate_restores_a_valid_session() {
        let (service, store, api) = service();
        let session = stored_session(3600);
        store
            .put(SESSION_KEY, &serde_json::to_string(&session).unwrap())
            .unwrap();

        service.hydrate();

        assert_eq!(service.current(), SessionState::SignedIn(session.clone()));
        assert_eq!(api.token(), Some(session.token));
    }

    #[tokio::test]
    async fn hydrate_clears_an_expired_session() {
        let (service, store, api) = service();
        let session = stored_session(-3600);
        store
            .put(SESSION_KEY, &serde_json::to_string(&session).unwrap())
            .unwrap();

        service.hydrate();

        assert_eq!(service.current(), SessionState::SignedOut);
        assert_eq!(store.get(SESSION_KEY).unwrap(), None);
        assert_eq!(api.token(), None);
    }

    #[tokio::test]
    async fn hydrate_clears_a_corrupt_record() {
        let (service, store, _) = service();
        store.put(SESSION_KEY, "{definitely not json").unwrap();

        service.hydrate();

        assert_eq!(service.current(), SessionState::SignedOut);
        assert_eq!(store.get(SESSION_KEY).unwrap(), None);
    }

    #[tokio::test]
    async fn hydrate_with_empty_store_signs_out() {
        let (service, _, _) = service();
        service.hydrate();
        assert_eq!(service.current(), SessionState::SignedOut);
    }

    #[tokio::test]
    async fn logout_clears_store_token_and_state() {
        let (service, store, api) = service();
        let session = stored_session(3600);
        store
            .put(SESSION_KEY, &serde_json::to_string(&session).unwrap())
            .unwrap();
        service.hydrate();

        service.logout().unwrap();

        assert_eq!(service.current(), SessionState::SignedOut);
        assert_eq!(store.get(SESSION_KEY).unwrap(), None);
        assert_eq!(api.token(), None);
    }

    #[tokio::test]
    async fn external_change_rehydrates() {
        let (service, store, _) = service();
        service.hydrate();
        assert_eq!(service.current(), SessionState::SignedOut);

        let mut state = service.state();

        // Another instance signs in and pokes the change signal.
        let session = stored_session(3600);
        store
            .put(SESSION_KEY, &serde_json::to_string(&session).unwrap())
            .unwrap();
        store.notify_external(SESSION_KEY);

        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            loop {
                state.changed().await.unwrap();
                if matches!(&*state.borrow(), SessionState::SignedIn(_)) {
                    break;
                }
            }
        })
        .await
        .expect("never observed the external sign-in");
    }

    #[tokio::test]
    async fn unrelated_store_keys_are_ignored() {
        let (service, store, _) = service();
        service.hydrate();

        store.put("draft:123", "some draft text").unwrap();
        store.notify_external("draft:123");

        // Give the listener a beat; state must stay SignedOut.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(service.current(), SessionState::SignedOut);
    }

    #[test]
    fn token_peek_accepts_future_exp_and_rejects_past() {
        let id = Uuid::new_v4();
        assert!(token_usable(&mint_token(id, 3600)));
        assert!(!token_usable(&mint_token(id, -3600)));
        assert!(!token_usable("not-a-jwt"));
    }
}
