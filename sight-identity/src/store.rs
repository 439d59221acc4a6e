use std::{
    fs::{self, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::info;

use crate::keypair::{KeyError, Keypair};

pub const KEYPAIR_FILE: &str = "device-keypair.json";

#[derive(Debug, Error)]
pub enum KeyStoreError {
    #[error("unable to read keypair {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("keypair file {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("keypair file {path} is invalid: {source}")]
    Invalid {
        path: PathBuf,
        #[source]
        source: KeyError,
    },
    #[error("unable to write keypair {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to encode keypair: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("no home directory found; configure a data directory")]
    NoHomeDir,
}

/// Directory holding the keypair file: `<root>/config` for an explicit data
/// root, `~/.sightai/config` otherwise.
pub fn keypair_dir(data_root: Option<&Path>) -> Result<PathBuf, KeyStoreError> {
    match data_root {
        Some(root) => Ok(root.join("config")),
        None => dirs::home_dir()
            .map(|home| home.join(".sightai").join("config"))
            .ok_or(KeyStoreError::NoHomeDir),
    }
}

/// Owns the on-disk keypair file.
///
/// The file is the only record of the node's identity, so a file that exists
/// but cannot be decoded is an error: regenerating would silently move the
/// node to a different DID.
#[derive(Clone, Debug)]
pub struct KeypairStore {
    path: PathBuf,
}

impl KeypairStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn in_data_dir(data_root: Option<&Path>) -> Result<Self, KeyStoreError> {
        Ok(Self::new(keypair_dir(data_root)?.join(KEYPAIR_FILE)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the keypair and bumps `lastUsed`, or generates and persists a new
    /// one when no file exists yet. Both paths write the file.
    pub fn load_or_create(&self) -> Result<Keypair, KeyStoreError> {
        self.load_or_create_at(Utc::now())
    }

    pub fn load_or_create_at(&self, now: DateTime<Utc>) -> Result<Keypair, KeyStoreError> {
        match fs::read(&self.path) {
            Ok(raw) => {
                let mut keypair: Keypair =
                    serde_json::from_slice(&raw).map_err(|source| KeyStoreError::Corrupt {
                        path: self.path.clone(),
                        source,
                    })?;
                keypair.verify().map_err(|source| KeyStoreError::Invalid {
                    path: self.path.clone(),
                    source,
                })?;
                keypair.touch(now);
                self.save(&keypair)?;
                info!(path = %self.path.display(), "loaded node keypair");
                Ok(keypair)
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                let keypair = Keypair::generate(now);
                self.save(&keypair)?;
                info!(path = %self.path.display(), "generated new node keypair");
                Ok(keypair)
            }
            Err(source) => Err(KeyStoreError::Read {
                path: self.path.clone(),
                source,
            }),
        }
    }

    /// Whole-file replace via a sibling temp file and rename, so a crash
    /// leaves either the old or the new keypair on disk.
    pub fn save(&self, keypair: &Keypair) -> Result<(), KeyStoreError> {
        let encoded = serde_json::to_vec(keypair).map_err(KeyStoreError::Encode)?;
        let write_err = |source| KeyStoreError::Write {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(write_err)?;
        }
        let tmp_path = self.tmp_path();
        let mut file = open_private(&tmp_path).map_err(write_err)?;
        file.write_all(&encoded).map_err(write_err)?;
        file.sync_all().map_err(write_err)?;
        drop(file);
        fs::rename(&tmp_path, &self.path).map_err(write_err)
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| KEYPAIR_FILE.into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

fn open_private(path: &Path) -> io::Result<fs::File> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options.open(path)
}
