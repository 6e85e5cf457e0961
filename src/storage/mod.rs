//! # Storage Module - Persistence Boundary
//!
//! The gateway keeps its model in memory; this module is the injected dependency that
//! loads it at startup and saves it when it changes.
//!
//! ## Features
//!
//! - **Message Store**: In-memory chat history with deduplication ([`messages`])
//! - **Persistence Trait**: Load-once / save-on-change contract used by the core
//! - **JSON Files**: Atomic writes (temp file + rename + directory fsync)
//! - **Directory Lock**: An exclusive `fs2` lock stops two gateways sharing a data dir
//!
//! ## Layout
//!
//! ```text
//! data/
//! ├── .lock           ← held while a gateway runs
//! ├── profile.json    ← display name and node id
//! ├── nodes.json      ← known nodes
//! └── messages.json   ← chat history
//! ```
//!
//! ## Configuration
//!
//! ```toml
//! [storage]
//! data_dir = "./data"
//! persist = true
//! flush_interval_secs = 30
//! ```

pub mod messages;

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use fs2::FileExt;
use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::gateway::registry::Node;
use crate::gateway::Profile;
use messages::Message;

const PROFILE_FILE: &str = "profile.json";
const NODES_FILE: &str = "nodes.json";
const MESSAGES_FILE: &str = "messages.json";
const LOCK_FILE: &str = ".lock";

/// Everything read back at startup.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub profile: Option<Profile>,
    pub nodes: Vec<Node>,
    pub messages: Vec<Message>,
}

/// Borrowed view of the live state handed to [`Persistence::save`].
#[derive(Debug, Serialize)]
pub struct SnapshotRef<'a> {
    pub profile: &'a Profile,
    pub nodes: &'a [Node],
    pub messages: Vec<&'a Message>,
}

/// Load-at-startup, write-on-change storage for the gateway model.
pub trait Persistence: Send + 'static {
    fn describe(&self) -> String;
    fn load(&mut self) -> Result<Snapshot>;
    fn save(&mut self, state: &SnapshotRef<'_>) -> Result<()>;
}

/// Keeps nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStore;

impl Persistence for NullStore {
    fn describe(&self) -> String {
        "memory only".to_string()
    }

    fn load(&mut self) -> Result<Snapshot> {
        Ok(Snapshot::default())
    }

    fn save(&mut self, _state: &SnapshotRef<'_>) -> Result<()> {
        Ok(())
    }
}

/// JSON files under one directory, locked for the lifetime of the store.
#[derive(Debug)]
pub struct JsonFileStore {
    dir: PathBuf,
    _lock: File,
}

impl JsonFileStore {
    /// Create the directory if needed and take the exclusive lock.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create data directory {}", dir.display()))?;
        let lock = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(dir.join(LOCK_FILE))?;
        lock.try_lock_exclusive().map_err(|_| {
            anyhow!(
                "Data directory {} is in use by another gateway",
                dir.display()
            )
        })?;
        debug!("Locked data directory {}", dir.display());
        Ok(Self { dir, _lock: lock })
    }

    /// Read whatever is persisted in `dir` without taking the lock.
    pub fn read_snapshot<P: AsRef<Path>>(dir: P) -> Result<Snapshot> {
        let dir = dir.as_ref();
        Ok(Snapshot {
            profile: read_json(&dir.join(PROFILE_FILE))?,
            nodes: read_json(&dir.join(NODES_FILE))?.unwrap_or_default(),
            messages: read_json(&dir.join(MESSAGES_FILE))?.unwrap_or_default(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl Persistence for JsonFileStore {
    fn describe(&self) -> String {
        self.dir.display().to_string()
    }

    fn load(&mut self) -> Result<Snapshot> {
        Self::read_snapshot(&self.dir)
    }

    fn save(&mut self, state: &SnapshotRef<'_>) -> Result<()> {
        write_json_atomic(&self.dir.join(PROFILE_FILE), state.profile)?;
        write_json_atomic(&self.dir.join(NODES_FILE), &state.nodes)?;
        write_json_atomic(&self.dir.join(MESSAGES_FILE), &state.messages)?;
        Ok(())
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("Failed to read {}", path.display())),
    };
    // Guard against leading NULs left by an interrupted write on some filesystems
    let cleaned = content.trim_start_matches('\0');
    if cleaned.trim().is_empty() {
        warn!("{} is empty; ignoring", path.display());
        return Ok(None);
    }
    let value = serde_json::from_str(cleaned)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    Ok(Some(value))
}

/// Write to a unique temp file in the same directory, fsync, rename over `path`, then
/// fsync the directory.
fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let content = serde_json::to_string_pretty(value)?;
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let base = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("state.json");
    let mut counter = 0u32;
    let tmp_path = loop {
        let candidate = dir.join(format!(".{}.tmp-{}-{}", base, std::process::id(), counter));
        match OpenOptions::new().write(true).create_new(true).open(&candidate) {
            Ok(mut tmp) => {
                tmp.write_all(content.as_bytes())?;
                tmp.flush()?;
                let _ = tmp.sync_all();
                break candidate;
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                counter = counter.saturating_add(1);
                continue;
            }
            Err(e) => return Err(anyhow!("Failed to create temp file for atomic write: {}", e)),
        }
    };
    std::fs::rename(&tmp_path, path)?;
    if let Ok(dir_file) = File::open(dir) {
        let _ = dir_file.sync_all();
    }
    Ok(())
}
