/// Position store - durable home/dip/close snapshot.

use crate::axis::Positions;
use crate::error::{MotionError, MotionResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;

/// Named positions an operator can save.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamedPosition {
    Home,
    Dip,
    Close,
}

impl FromStr for NamedPosition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "home" | "open" => Ok(NamedPosition::Home),
            "dip" => Ok(NamedPosition::Dip),
            "close" => Ok(NamedPosition::Close),
            other => Err(format!("unknown position name '{}'", other)),
        }
    }
}

impl fmt::Display for NamedPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NamedPosition::Home => "home",
            NamedPosition::Dip => "dip",
            NamedPosition::Close => "close",
        };
        write!(f, "{}", name)
    }
}

/// `None` means "not yet calibrated".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistedSnapshot {
    pub home: Option<Positions>,
    pub dip: Option<Positions>,
    pub close: Option<Positions>,
    /// Axis positions when the snapshot was written
    pub current: Option<Positions>,
    pub saved_at: Option<DateTime<Utc>>,
}

impl PersistedSnapshot {
    pub fn get(&self, name: NamedPosition) -> Option<Positions> {
        match name {
            NamedPosition::Home => self.home,
            NamedPosition::Dip => self.dip,
            NamedPosition::Close => self.close,
        }
    }

    pub fn set(&mut self, name: NamedPosition, value: Positions) {
        match name {
            NamedPosition::Home => self.home = Some(value),
            NamedPosition::Dip => self.dip = Some(value),
            NamedPosition::Close => self.close = Some(value),
        }
    }
}

pub trait PositionStore: Send + Sync {
    fn load(&self) -> MotionResult<PersistedSnapshot>;
    fn save(&self, snapshot: &PersistedSnapshot) -> MotionResult<()>;
}

/// Load, falling back to an empty snapshot with a warning.
pub fn load_or_default(store: &dyn PositionStore) -> PersistedSnapshot {
    match store.load() {
        Ok(snapshot) => snapshot,
        Err(e) => {
            log::warn!(target: "position_store", "{}; starting uncalibrated", e);
            PersistedSnapshot::default()
        }
    }
}

/// YAML file next to the host config. A missing file is an empty snapshot.
#[derive(Debug, Clone)]
pub struct YamlPositionStore {
    path: PathBuf,
}

impl YamlPositionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PositionStore for YamlPositionStore {
    fn load(&self) -> MotionResult<PersistedSnapshot> {
        if !self.path.exists() {
            return Ok(PersistedSnapshot::default());
        }
        let text = fs::read_to_string(&self.path)
            .map_err(|e| MotionError::PersistenceFault(format!("read {:?}: {}", self.path, e)))?;
        if text.trim().is_empty() {
            return Ok(PersistedSnapshot::default());
        }
        serde_yaml::from_str(&text)
            .map_err(|e| MotionError::PersistenceFault(format!("parse {:?}: {}", self.path, e)))
    }

    fn save(&self, snapshot: &PersistedSnapshot) -> MotionResult<()> {
        let text = serde_yaml::to_string(snapshot)
            .map_err(|e| MotionError::PersistenceFault(e.to_string()))?;
        // Write then rename so a crash never leaves a half-written file
        let tmp = self.path.with_extension("yaml.tmp");
        fs::write(&tmp, text)
            .and_then(|_| fs::rename(&tmp, &self.path))
            .map_err(|e| MotionError::PersistenceFault(format!("write {:?}: {}", self.path, e)))?;
        log::debug!(target: "position_store", "Saved positions to {:?}", self.path);
        Ok(())
    }
}

/// In-memory store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryPositionStore {
    snapshot: Mutex<PersistedSnapshot>,
    fail_saves: bool,
}

impl MemoryPositionStore {
    pub fn new(snapshot: PersistedSnapshot) -> Self {
        Self { snapshot: Mutex::new(snapshot), fail_saves: false }
    }

    pub fn failing() -> Self {
        Self { fail_saves: true, ..Self::default() }
    }

    pub fn current(&self) -> PersistedSnapshot {
        self.snapshot.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl PositionStore for MemoryPositionStore {
    fn load(&self) -> MotionResult<PersistedSnapshot> {
        Ok(self.current())
    }

    fn save(&self, snapshot: &PersistedSnapshot) -> MotionResult<()> {
        if self.fail_saves {
            return Err(MotionError::PersistenceFault("store is read-only".to_string()));
        }
        *self.snapshot.lock().unwrap_or_else(|e| e.into_inner()) = snapshot.clone();
        Ok(())
    }
}
