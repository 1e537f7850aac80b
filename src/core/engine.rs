//! Collaborator traits for the OS filtering subsystem
//!
//! The kill-switch controller never talks to the OS directly; it drives one
//! of these trait implementations. [`crate::platform::windows::wfp`] binds
//! them to the Windows Filtering Platform; [`crate::sim::engine`] provides an
//! in-process engine for tests and plan inspection.
//!
//! A [`FilterSession`] maps to one open engine handle. Implementations
//! release the handle in `Drop`, so the handle is returned on every exit
//! path, including early failure.

use crate::core::error::Result;
use crate::core::filter::{FilterRule, Sublayer};
use uuid::Uuid;

/// Factory for filtering-subsystem sessions
pub trait FilterEngine {
    type Session: FilterSession;

    /// Acquires a session with the filtering subsystem.
    ///
    /// # Errors
    ///
    /// Returns [`crate::core::error::Error::EngineUnavailable`] if the
    /// subsystem cannot be reached (permissions, service down).
    fn open(&self) -> Result<Self::Session>;
}

/// One open session with the filtering subsystem
pub trait FilterSession {
    /// Installs a sub-layer.
    ///
    /// # Errors
    ///
    /// Returns [`crate::core::error::Error::RuleConflict`] if a sub-layer
    /// with the same identity already exists; the caller decides whether to
    /// delete and retry.
    fn add_sublayer(&mut self, sublayer: &Sublayer) -> Result<()>;

    /// Removes a sub-layer by identity. Absence is not an error.
    fn delete_sublayer(&mut self, key: Uuid) -> Result<()>;

    /// Installs one rule.
    ///
    /// # Errors
    ///
    /// Returns [`crate::core::error::Error::RuleConflict`] if a rule with
    /// the same identity already exists.
    fn add_rule(&mut self, rule: &FilterRule) -> Result<()>;

    /// Removes a rule by identity. Absence is not an error.
    fn delete_rule(&mut self, key: Uuid) -> Result<()>;

    /// Presence check by identity, used by the engagement query
    fn find_rule(&self, key: Uuid) -> Result<bool>;
}
