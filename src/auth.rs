use std::fmt::Debug;
use std::sync::Arc;

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use async_trait::async_trait;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{
    finish_authentication, AuthSource, DefaultServerParameterProvider, LoginInfo, Password,
    StartupHandler,
};
use pgwire::api::{ClientInfo, METADATA_USER};
use pgwire::error::{PgWireError, PgWireResult};
use pgwire::messages::{PgWireBackendMessage, PgWireFrontendMessage};
use ring::rand::{SecureRandom, SystemRandom};
use tracing::{debug, warn};
use ulid::Ulid;

use crate::engine::{Engine, EngineError};

// ── Connection handshake ────────────────────────────────────────

/// Metadata key holding the account id a session authenticated as.
/// Absent for anonymous sessions.
pub const SESSION_USER_ID: &str = "spacebook.user_id";

/// The shared server password, as seen by the startup step of the
/// cleartext handshake.
#[derive(Debug)]
pub struct SpacebookAuthSource {
    password: String,
}

impl SpacebookAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for SpacebookAuthSource {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

/// Cleartext handshake. A login that names a registered email must present
/// that account's password; any other login is anonymous and must present
/// the server password. The authenticated account id is pinned in the
/// session metadata under [`SESSION_USER_ID`].
pub struct SpacebookStartupHandler {
    engine: Arc<Engine>,
    server_password: String,
    params: DefaultServerParameterProvider,
    cleartext: CleartextPasswordAuthStartupHandler<SpacebookAuthSource, DefaultServerParameterProvider>,
}

impl SpacebookStartupHandler {
    pub fn new(engine: Arc<Engine>, server_password: String) -> Self {
        Self {
            engine,
            server_password: server_password.clone(),
            params: DefaultServerParameterProvider::default(),
            cleartext: CleartextPasswordAuthStartupHandler::new(
                SpacebookAuthSource::new(server_password),
                DefaultServerParameterProvider::default(),
            ),
        }
    }

    /// Account the login authenticates as, `None` for anonymous.
    async fn check_login(&self, name: &str, password: &str) -> PgWireResult<Option<Ulid>> {
        let refused = || PgWireError::InvalidPassword(name.to_string());
        match self.engine.authenticate(name, password).await {
            Ok(Some(user)) => Ok(Some(user.id)),
            Ok(None) if password == self.server_password => Ok(None),
            Ok(None) => Err(refused()),
            Err(EngineError::WrongPassword) => Err(refused()),
            Err(e) => {
                warn!("login check for {name} failed: {e}");
                Err(refused())
            }
        }
    }
}

#[async_trait]
impl StartupHandler for SpacebookStartupHandler {
    async fn on_startup<C>(&self, client: &mut C, message: PgWireFrontendMessage) -> PgWireResult<()>
    where
        C: ClientInfo + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<<C as Sink<PgWireBackendMessage>>::Error>,
    {
        match message {
            PgWireFrontendMessage::PasswordMessageFamily(msg) => {
                let supplied = msg.into_password()?;
                let login = client.metadata().get(METADATA_USER).cloned().unwrap_or_default();
                let user_id = self.check_login(&login, &supplied.password).await?;
                let metadata = client.metadata_mut();
                match user_id {
                    Some(id) => {
                        metadata.insert(SESSION_USER_ID.to_string(), id.to_string());
                    }
                    // A client may send the key as a startup parameter.
                    None => {
                        metadata.remove(SESSION_USER_ID);
                    }
                }
                debug!(user_id = ?user_id, "session authenticated");
                finish_authentication(client, &self.params).await
            }
            // Startup parameters and the password request.
            other => self.cleartext.on_startup(client, other).await,
        }
    }
}

// ── Account passwords ───────────────────────────────────────────

/// Opaque password hashing used for registration and password changes.
pub trait AuthService: Send + Sync {
    fn hash(&self, plaintext: &str) -> Result<String, EngineError>;
    fn verify(&self, plaintext: &str, hash: &str) -> bool;
}

/// Argon2id with PHC-string output.
pub struct Argon2AuthService {
    params: Params,
}

impl Argon2AuthService {
    pub fn new() -> Self {
        Self {
            params: Params::default(),
        }
    }

    /// Custom cost parameters (memory in KiB, iterations, parallelism).
    pub fn with_cost(memory_cost: u32, iterations: u32, parallelism: u32) -> Result<Self, EngineError> {
        let params = Params::new(memory_cost, iterations, parallelism, None)
            .map_err(|e| EngineError::HashError(format!("invalid Argon2id parameters: {e}")))?;
        Ok(Self { params })
    }
}

impl Default for Argon2AuthService {
    fn default() -> Self {
        Self::new()
    }
}

fn generate_salt() -> Result<SaltString, EngineError> {
    let rng = SystemRandom::new();
    let mut salt = [0u8; 16];
    rng.fill(&mut salt)
        .map_err(|_| EngineError::HashError("failed to generate random salt".into()))?;
    SaltString::encode_b64(&salt).map_err(|e| EngineError::HashError(e.to_string()))
}

impl AuthService for Argon2AuthService {
    fn hash(&self, plaintext: &str) -> Result<String, EngineError> {
        let salt = generate_salt()?;
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, self.params.clone());
        argon2
            .hash_password(plaintext.as_bytes(), &salt)
            .map(|h| h.to_string())
            .map_err(|e| EngineError::HashError(e.to_string()))
    }

    /// Cost parameters are read back from the PHC string.
    fn verify(&self, plaintext: &str, hash: &str) -> bool {
        let Ok(parsed) = PasswordHash::new(hash) else {
            return false;
        };
        Argon2::default()
            .verify_password(plaintext.as_bytes(), &parsed)
            .is_ok()
    }
}
