use std::collections::HashMap;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use chrono::Utc;
use serde_json::json;

use crate::config::SideStoreConfig;
use crate::directory::records::split_scheme;
use crate::logging::{LogLevel, Logger};
use crate::storage::{expand_home_path, StorageError};

/// A decentralized store that node components are saved into, keyed by URI scheme.
pub trait SideStore: Send + Sync {
    fn scheme(&self) -> &str;
    fn save(&self, path: &str) -> Result<(), SideStoreError>;
}

#[derive(Debug)]
pub enum SideStoreError {
    MissingScheme { uri: String },
    UnknownScheme { scheme: String },
    EmptyPath,
    LedgerPath(StorageError),
    Io { path: PathBuf, source: io::Error },
    SpawnWorker(io::Error),
}

impl fmt::Display for SideStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingScheme { uri } => write!(f, "components uri '{uri}' has no scheme prefix"),
            Self::UnknownScheme { scheme } => write!(f, "no side store registered for scheme '{scheme}'"),
            Self::EmptyPath => write!(f, "components path is empty"),
            Self::LedgerPath(source) => write!(f, "cannot resolve pin ledger path: {source}"),
            Self::Io { path, source } => {
                write!(f, "pin ledger io error at '{}': {source}", path.display())
            }
            Self::SpawnWorker(source) => write!(f, "failed to spawn side store worker: {source}"),
        }
    }
}

impl std::error::Error for SideStoreError {}

impl From<StorageError> for SideStoreError {
    fn from(value: StorageError) -> Self {
        Self::LedgerPath(value)
    }
}

/// Records every pinned path as one JSON line in `<dir>/<scheme>.ledger`.
pub struct PinLedgerStore {
    scheme: String,
    ledger_file: PathBuf,
    write_lock: Mutex<()>,
}

impl PinLedgerStore {
    pub fn new(scheme: impl Into<String>, ledger_dir: &Path) -> Self {
        let scheme = scheme.into();
        let ledger_file = ledger_dir.join(format!("{scheme}.ledger"));
        Self {
            scheme,
            ledger_file,
            write_lock: Mutex::new(()),
        }
    }

    /// Paths saved so far, oldest first.
    pub fn pinned(&self) -> Result<Vec<String>, SideStoreError> {
        let raw = match fs::read_to_string(&self.ledger_file) {
            Ok(raw) => raw,
            Err(source) if source.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(self.io_error(source)),
        };
        Ok(raw
            .lines()
            .filter_map(|line| serde_json::from_str::<serde_json::Value>(line).ok())
            .filter_map(|entry| entry.get("path").and_then(|path| path.as_str()).map(str::to_owned))
            .collect())
    }

    fn io_error(&self, source: io::Error) -> SideStoreError {
        SideStoreError::Io {
            path: self.ledger_file.clone(),
            source,
        }
    }
}

impl SideStore for PinLedgerStore {
    fn scheme(&self) -> &str {
        &self.scheme
    }

    fn save(&self, path: &str) -> Result<(), SideStoreError> {
        if path.is_empty() {
            return Err(SideStoreError::EmptyPath);
        }

        let line = json!({
            "scheme": self.scheme,
            "path": path,
            "saved_at": Utc::now().to_rfc3339(),
        })
        .to_string();

        let _guard = self.write_lock.lock().expect("pin ledger lock poisoned");
        if let Some(parent) = self.ledger_file.parent() {
            fs::create_dir_all(parent).map_err(|source| self.io_error(source))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.ledger_file)
            .map_err(|source| self.io_error(source))?;
        writeln!(file, "{line}").map_err(|source| self.io_error(source))
    }
}

#[derive(Clone, Default)]
pub struct SideStores {
    stores: HashMap<String, Arc<dyn SideStore>>,
}

impl SideStores {
    pub fn new() -> Self {
        Self::default()
    }

    /// One pin ledger per configured scheme.
    pub fn from_config(config: &SideStoreConfig) -> Result<Self, SideStoreError> {
        let ledger_dir = expand_home_path(&config.ledger_path)?;
        let mut stores = Self::new();
        for scheme in &config.schemes {
            stores.register(Arc::new(PinLedgerStore::new(scheme.as_str(), &ledger_dir)));
        }
        Ok(stores)
    }

    pub fn register(&mut self, store: Arc<dyn SideStore>) {
        self.stores.insert(store.scheme().to_owned(), store);
    }

    pub fn get(&self, scheme: &str) -> Option<Arc<dyn SideStore>> {
        self.stores.get(scheme).cloned()
    }

    pub fn schemes(&self) -> Vec<String> {
        let mut schemes: Vec<String> = self.stores.keys().cloned().collect();
        schemes.sort();
        schemes
    }

    /// Saves synchronously into the store matching the URI scheme.
    pub fn save(&self, components_uri: &str) -> Result<(), SideStoreError> {
        let (scheme, path) = split_scheme(components_uri).ok_or_else(|| SideStoreError::MissingScheme {
            uri: components_uri.to_owned(),
        })?;
        let store = self.get(scheme).ok_or_else(|| SideStoreError::UnknownScheme {
            scheme: scheme.to_owned(),
        })?;
        store.save(path)
    }

    /// Best-effort save on a detached thread. Failures are logged at warn only.
    pub fn spawn_save(&self, components_uri: &str, logger: Arc<Logger>) -> Option<JoinHandle<()>> {
        let stores = self.clone();
        let uri = components_uri.to_owned();
        let worker_logger = Arc::clone(&logger);
        let spawned = thread::Builder::new()
            .name("side-store-save".to_owned())
            .spawn(move || match stores.save(&uri) {
                Ok(()) => worker_logger.log(
                    LogLevel::Debug,
                    Some("side_store"),
                    "Saved components",
                    Some(json!({ "components": uri })),
                ),
                Err(error) => worker_logger.log(
                    LogLevel::Warn,
                    Some("side_store"),
                    "Side store save failed",
                    Some(json!({ "components": uri, "error": error.to_string() })),
                ),
            });

        match spawned {
            Ok(handle) => Some(handle),
            Err(source) => {
                logger.log(
                    LogLevel::Warn,
                    Some("side_store"),
                    "Side store save failed",
                    Some(json!({
                        "components": components_uri,
                        "error": SideStoreError::SpawnWorker(source).to_string(),
                    })),
                );
                None
            }
        }
    }
}
