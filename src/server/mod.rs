//! The TCP shell server: a listener spawning one session thread per
//! connection over shared state (the store behind a single mutex, the
//! token registry, the lockdown tracker, and per-token session counts).

mod command;
mod lockdown;
mod session;
mod status;

pub use lockdown::Lockdown;
pub use status::Status;

use crate::config::Config;
use crate::errinput;
use crate::error::Result;
use crate::storage::{Store, FORMAT_VERSION};

use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::{SocketAddr, TcpListener};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// The access token registry, loaded from a JSON file. Its signature is
/// the deployment signature written to shard file headers.
#[derive(Clone, Debug, Deserialize)]
pub struct Tokens {
    /// The 8-character ASCII deployment signature.
    pub signature: String,
    /// The shard file format version this deployment uses.
    pub meid_version: u16,
    /// Token → access grant.
    pub access_keys: HashMap<String, AccessKey>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct AccessKey {
    pub alias: String,
    #[serde(default)]
    pub permissions: Vec<String>,
    /// Concurrent sessions allowed for this token, -1 for unlimited.
    #[serde(default = "unlimited")]
    pub max_connections: i64,
}

fn unlimited() -> i64 {
    -1
}

impl Tokens {
    /// Loads and validates the token file.
    pub fn load(path: &str) -> Result<Self> {
        let tokens: Tokens = serde_json::from_slice(&std::fs::read(path)?)?;
        tokens.validate()?;
        Ok(tokens)
    }

    fn validate(&self) -> Result<()> {
        if self.signature.len() != 8 || !self.signature.is_ascii() {
            return errinput!("token file signature must be exactly 8 ASCII characters");
        }
        if self.meid_version != FORMAT_VERSION {
            return errinput!(
                "token file meid_version {} does not match supported version {FORMAT_VERSION}",
                self.meid_version
            );
        }
        Ok(())
    }

    /// The signature as header bytes.
    pub fn signature_bytes(&self) -> Result<[u8; 8]> {
        self.validate()?;
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(self.signature.as_bytes());
        Ok(bytes)
    }
}

/// State shared by all session threads.
pub(crate) struct Shared {
    pub config: Config,
    pub store: Mutex<Store>,
    pub tokens: Tokens,
    pub lockdown: Lockdown,
    /// Token → live session count.
    pub sessions: Mutex<HashMap<String, usize>>,
    /// Pre-compiled origin allowlist, reused by the HTTP face.
    pub origins: Vec<Regex>,
    /// Maximum input line size in bytes, 0 for unlimited.
    pub input_limit: u64,
    pub registry: command::Registry,
}

impl Shared {
    pub(crate) fn new(
        config: Config,
        tokens: Tokens,
        store: Store,
        lockdown: Lockdown,
    ) -> Result<Self> {
        let mut origins = Vec::with_capacity(config.server.allowed_origins.len());
        for pattern in &config.server.allowed_origins {
            origins.push(Regex::new(pattern)?);
        }
        let input_limit = config.cli_input_size()?;
        Ok(Self {
            store: Mutex::new(store),
            tokens,
            lockdown,
            sessions: Mutex::new(HashMap::new()),
            origins,
            input_limit,
            registry: command::Registry::new(),
            config,
        })
    }

    /// Locks the store, recovering from a poisoned lock (the tables are
    /// valid after any completed mutation).
    pub(crate) fn store(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn sessions(&self) -> MutexGuard<'_, HashMap<String, usize>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Total live sessions across all tokens.
    pub(crate) fn session_count(&self) -> usize {
        self.sessions().values().sum()
    }
}

/// The sfdb shell server.
pub struct Server {
    listener: TcpListener,
    shared: Arc<Shared>,
}

impl Server {
    /// Binds the shell listener and assembles the shared state. The
    /// collaborators (store, tokens, lockdown) are constructed by the
    /// caller and passed in explicitly.
    pub fn new(config: Config, tokens: Tokens, store: Store, lockdown: Lockdown) -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", config.server.cli_port))?;
        let shared = Arc::new(Shared::new(config, tokens, store, lockdown)?);
        Ok(Self { listener, shared })
    }

    /// The bound listener address. Useful when binding port 0.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts and serves shell sessions until the listener fails.
    pub fn serve(&self) -> Result<()> {
        log::info!("Listening on {}", self.local_addr()?);
        for stream in self.listener.incoming() {
            match stream {
                Ok(stream) => {
                    let shared = self.shared.clone();
                    std::thread::spawn(move || session::run(shared, stream));
                }
                Err(err) => log::error!("Connection failed: {err}"),
            }
        }
        Ok(())
    }

    /// Returns true if an origin matches the allowlist patterns compiled
    /// at server start.
    pub fn origin_allowed(&self, origin: &str) -> bool {
        self.shared.origins.iter().any(|pattern| pattern.is_match(origin))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LockdownMode;
    use crate::storage::StoreOptions;
    use std::time::Duration;

    #[test]
    fn token_validation() {
        let mut tokens = Tokens {
            signature: "SFDB0001".to_string(),
            meid_version: FORMAT_VERSION,
            access_keys: HashMap::new(),
        };
        assert_eq!(tokens.signature_bytes().unwrap(), *b"SFDB0001");

        tokens.signature = "short".to_string();
        assert!(tokens.signature_bytes().is_err());

        tokens.signature = "SFDB0001".to_string();
        tokens.meid_version = 9;
        assert!(tokens.validate().is_err());
    }

    #[test]
    fn token_file_parsing() {
        let dir = tempfile::TempDir::with_prefix("sfdb").unwrap();
        let path = dir.path().join("tokens.json");
        std::fs::write(
            &path,
            r#"{
                "signature": "SFDB0001",
                "meid_version": 1,
                "access_keys": {
                    "": {"alias": "guest", "permissions": [], "max_connections": -1},
                    "secret": {"alias": "admin", "permissions": ["all"], "max_connections": 2}
                }
            }"#,
        )
        .unwrap();

        let tokens = Tokens::load(path.to_str().unwrap()).unwrap();
        assert_eq!(tokens.access_keys[""].alias, "guest");
        assert_eq!(tokens.access_keys["secret"].max_connections, 2);
    }

    #[test]
    fn origin_predicate() {
        let dir = tempfile::TempDir::with_prefix("sfdb").unwrap();
        let mut config = Config::load("nonexistent-config-file").unwrap();
        config.server.cli_port = 0;
        config.server.allowed_origins =
            vec!["^https://.*\\.example\\.com$".to_string(), "^http://localhost".to_string()];
        let store = Store::open(
            dir.path().join("db"),
            StoreOptions { persistent: false, ..StoreOptions::default() },
        )
        .unwrap();
        let tokens = Tokens {
            signature: "SFDB0001".to_string(),
            meid_version: FORMAT_VERSION,
            access_keys: HashMap::new(),
        };
        let lockdown = Lockdown::load(
            LockdownMode::None,
            0,
            Duration::from_secs(60),
            dir.path().join(".lockdown"),
        );
        let server = Server::new(config, tokens, store, lockdown).unwrap();

        assert!(server.origin_allowed("https://app.example.com"));
        assert!(server.origin_allowed("http://localhost:3000"));
        assert!(!server.origin_allowed("https://evil.test"));
    }
}
