//! Sync settings parsed from raw configuration values.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use camino::Utf8Path;
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

/// Errors raised while interpreting sync settings.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum SyncSettingsError {
    /// The raw value is malformed or carries an invalid ignore pattern.
    #[error("invalid sync configuration: {message}")]
    Invalid {
        /// Description of the problem.
        message: String,
    },
}

/// User-facing sync settings.
///
/// Parsed from a JSON value shaped like
/// `{"enabled": true, "ignore": ["*.tmp"], "destination": "/srv/work"}`.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncSettings {
    /// Glob patterns, relative to the workspace root, that are never synced.
    #[serde(default)]
    pub ignore: Vec<String>,
    /// Remote directory overriding the default workspace destination.
    #[serde(default)]
    pub destination: Option<String>,
    /// Whether save-triggered file copies are active.
    #[serde(default)]
    pub enabled: bool,
}

impl SyncSettings {
    /// Parses settings from a raw configuration value.
    ///
    /// `null` yields the disabled defaults.
    ///
    /// # Errors
    ///
    /// Returns [`SyncSettingsError::Invalid`] when the value has the wrong
    /// shape.
    pub fn from_value(value: &Value) -> Result<Self, SyncSettingsError> {
        if value.is_null() {
            return Ok(Self::default());
        }
        Self::deserialize(value).map_err(|err| SyncSettingsError::Invalid {
            message: err.to_string(),
        })
    }
}

/// Compiled ignore patterns.
///
/// A path is ignored when it, or any of its ancestor directories, matches a
/// pattern, so `target` excludes everything below `target/`.
#[derive(Clone)]
pub struct IgnoreSet {
    patterns: Vec<String>,
    set: GlobSet,
}

impl fmt::Debug for IgnoreSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IgnoreSet")
            .field("patterns", &self.patterns)
            .finish_non_exhaustive()
    }
}

impl Default for IgnoreSet {
    fn default() -> Self {
        Self::empty()
    }
}

impl IgnoreSet {
    /// Compiles `patterns` into a matcher.
    ///
    /// # Errors
    ///
    /// Returns [`SyncSettingsError::Invalid`] when a pattern does not parse.
    pub fn new<I, S>(patterns: I) -> Result<Self, SyncSettingsError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut builder = GlobSetBuilder::new();
        let mut kept = Vec::new();
        for pattern in patterns {
            let raw = pattern.as_ref().trim();
            if raw.is_empty() {
                continue;
            }
            let glob = Glob::new(raw).map_err(|err| SyncSettingsError::Invalid {
                message: format!("ignore pattern {raw:?}: {err}"),
            })?;
            builder.add(glob);
            kept.push(raw.to_owned());
        }
        let set = builder.build().map_err(|err| SyncSettingsError::Invalid {
            message: err.to_string(),
        })?;
        Ok(Self { patterns: kept, set })
    }

    /// Matcher that ignores nothing.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            patterns: Vec::new(),
            set: GlobSet::empty(),
        }
    }

    /// Patterns this set was compiled from.
    #[must_use]
    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    /// Returns `true` when `relative` or one of its ancestors is ignored.
    #[must_use]
    pub fn is_ignored(&self, relative: &Utf8Path) -> bool {
        if self.set.is_empty() {
            return false;
        }
        relative
            .ancestors()
            .filter(|candidate| !candidate.as_str().is_empty())
            .any(|candidate| self.set.is_match(candidate.as_str()))
    }
}

/// Settings together with their compiled ignore matcher.
#[derive(Clone, Debug, Default)]
pub struct ResolvedSettings {
    /// Parsed settings.
    pub settings: SyncSettings,
    /// Compiled form of `settings.ignore`.
    pub ignore: IgnoreSet,
}

impl ResolvedSettings {
    /// Compiles `settings`.
    ///
    /// # Errors
    ///
    /// Returns [`SyncSettingsError::Invalid`] for unparsable ignore patterns.
    pub fn compile(settings: SyncSettings) -> Result<Self, SyncSettingsError> {
        let ignore = IgnoreSet::new(&settings.ignore)?;
        Ok(Self { settings, ignore })
    }

    /// Parses and compiles a raw configuration value.
    ///
    /// # Errors
    ///
    /// Returns [`SyncSettingsError::Invalid`] when parsing or compiling fails.
    pub fn from_value(value: &Value) -> Result<Self, SyncSettingsError> {
        Self::compile(SyncSettings::from_value(value)?)
    }
}

/// Currently active settings, replaced wholesale.
///
/// Readers take a cheap `Arc` snapshot, so they always see one complete
/// value even while a replacement is in flight.
#[derive(Debug, Default)]
pub struct ActiveSettings {
    current: RwLock<Arc<ResolvedSettings>>,
}

impl ActiveSettings {
    /// Starts from `initial`.
    #[must_use]
    pub fn new(initial: ResolvedSettings) -> Self {
        Self {
            current: RwLock::new(Arc::new(initial)),
        }
    }

    /// Snapshot of the active settings.
    #[must_use]
    pub fn current(&self) -> Arc<ResolvedSettings> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Swaps in `next`.
    pub fn replace(&self, next: ResolvedSettings) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(next);
    }

    /// Applies a raw configuration value.
    ///
    /// An invalid value disables syncing instead of keeping stale settings.
    ///
    /// # Errors
    ///
    /// Returns the parse error after the fallback has been installed.
    pub fn apply_value(&self, value: &Value) -> Result<(), SyncSettingsError> {
        match ResolvedSettings::from_value(value) {
            Ok(resolved) => {
                info!(
                    enabled = resolved.settings.enabled,
                    ignore = ?resolved.settings.ignore,
                    destination = ?resolved.settings.destination,
                    "sync settings updated"
                );
                self.replace(resolved);
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "sync settings rejected; syncing disabled");
                self.replace(ResolvedSettings::default());
                Err(err)
            }
        }
    }
}
