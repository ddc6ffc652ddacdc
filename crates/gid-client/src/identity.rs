//! Persistent agent identity
//!
//! The agent's X25519 secret is stored as JSON in the user's data
//! directory. Losing the file means losing the agent id: messages still
//! queued at the relay for the old id can never be decrypted.

use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::time::SystemTime;

use gid_crypto::{AgentKeypair, AgentPublicKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::config::IdentityConfig;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("Identity already exists at {0} (use --force to replace it)")]
    AlreadyExists(PathBuf),

    #[error("No identity location available on this platform")]
    NoDefaultPath,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid key data: {0}")]
    InvalidKeyData(String),

    #[error("Unsupported identity file version {0}")]
    UnsupportedVersion(u32),
}

/// Agent identity information for display
#[derive(Debug, Clone, Serialize)]
pub struct IdentityInfo {
    pub agent_id: String,
    pub public_key: String,
    /// RFC3339
    pub created_at: String,
    pub path: PathBuf,
}

#[derive(Serialize, Deserialize)]
struct StoredIdentity {
    version: u32,
    /// X25519 secret (32 bytes, hex encoded)
    secret_hex: String,
    /// RFC3339
    created_at: String,
}

impl StoredIdentity {
    const CURRENT_VERSION: u32 = 1;

    fn new(keypair: &AgentKeypair, created_at: SystemTime) -> Self {
        let datetime: chrono::DateTime<chrono::Utc> = created_at.into();
        Self {
            version: Self::CURRENT_VERSION,
            secret_hex: hex::encode(keypair.secret_bytes()),
            created_at: datetime.to_rfc3339(),
        }
    }

    fn keypair(&self) -> Result<AgentKeypair, IdentityError> {
        if self.version != Self::CURRENT_VERSION {
            return Err(IdentityError::UnsupportedVersion(self.version));
        }
        let bytes = hex::decode(&self.secret_hex)
            .map_err(|e| IdentityError::InvalidKeyData(e.to_string()))?;
        let secret: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            IdentityError::InvalidKeyData(format!("expected 32 secret bytes, got {}", bytes.len()))
        })?;
        Ok(AgentKeypair::from_secret_bytes(&secret))
    }
}

/// File-based key storage
pub struct FileKeyStore {
    path: PathBuf,
}

impl FileKeyStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Get default identity file path
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("io", "gid", "gid")
            .map(|dirs| dirs.data_dir().join("identity.json"))
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    fn store(&self, identity: &StoredIdentity) -> Result<(), IdentityError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string_pretty(identity)
            .map_err(|e| IdentityError::Serialization(e.to_string()))?;

        // Write atomically using a temp file that is private from creation
        let temp_path = self.path.with_extension("tmp");
        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&temp_path)?;

        // mode() only applies on creation; tighten a leftover temp file too
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.set_permissions(fs::Permissions::from_mode(0o600))?;
        }

        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp_path, &self.path)?;
        Ok(())
    }

    fn load(&self) -> Result<Option<StoredIdentity>, IdentityError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&self.path)?;
        let stored: StoredIdentity = serde_json::from_str(&contents)
            .map_err(|e| IdentityError::Serialization(e.to_string()))?;
        Ok(Some(stored))
    }
}

/// Loads or creates the local agent identity.
pub struct IdentityManager {
    keypair: AgentKeypair,
    created_at: String,
    store: FileKeyStore,
}

impl IdentityManager {
    /// Load the identity, generating and persisting a new one on first run.
    pub fn init(config: &IdentityConfig) -> Result<Self, IdentityError> {
        Self::open(Self::store_for(config)?)
    }

    /// Generate a fresh identity, replacing an existing one only if `force`.
    pub fn create(config: &IdentityConfig, force: bool) -> Result<Self, IdentityError> {
        let store = Self::store_for(config)?;
        if store.exists() && !force {
            return Err(IdentityError::AlreadyExists(store.path.clone()));
        }
        Self::generate_into(store)
    }

    /// Load or create an identity at an explicit path.
    pub fn open(store: FileKeyStore) -> Result<Self, IdentityError> {
        match store.load()? {
            Some(stored) => {
                let keypair = stored.keypair()?;
                Ok(Self {
                    keypair,
                    created_at: stored.created_at,
                    store,
                })
            }
            None => Self::generate_into(store),
        }
    }

    fn store_for(config: &IdentityConfig) -> Result<FileKeyStore, IdentityError> {
        let path = match &config.key_path {
            Some(path) if !path.as_os_str().is_empty() => path.clone(),
            _ => FileKeyStore::default_path().ok_or(IdentityError::NoDefaultPath)?,
        };
        Ok(FileKeyStore::new(path))
    }

    fn generate_into(store: FileKeyStore) -> Result<Self, IdentityError> {
        let keypair = AgentKeypair::generate();
        let stored = StoredIdentity::new(&keypair, SystemTime::now());
        store.store(&stored)?;
        info!(
            "Generated new identity {} at {}",
            keypair.agent_id(),
            store.path.display()
        );
        Ok(Self {
            keypair,
            created_at: stored.created_at,
            store,
        })
    }

    pub fn keypair(&self) -> &AgentKeypair {
        &self.keypair
    }

    pub fn into_keypair(self) -> AgentKeypair {
        self.keypair
    }

    pub fn agent_id(&self) -> String {
        self.keypair.agent_id()
    }

    pub fn public_key(&self) -> AgentPublicKey {
        self.keypair.public_key()
    }

    pub fn info(&self) -> IdentityInfo {
        IdentityInfo {
            agent_id: self.agent_id(),
            public_key: self.public_key().to_hex(),
            created_at: self.created_at.clone(),
            path: self.store.path.clone(),
        }
    }
}
