//! Core kill-switch and dial lifecycle functionality
//!
//! This module contains the rule engine and the connection state machine:
//!
//! - [`filter`]: Data structures for filter rules and their identities
//! - [`engine`]: Collaborator traits for the OS filtering subsystem
//! - [`killswitch`]: Rule-plan composition and engage/disengage/status
//! - [`dial_service`]: Collaborator trait for the OS dial subsystem
//! - [`provision`]: IKEv2 phonebook entry provisioning
//! - [`dial`]: Asynchronous connect/abort/error state machine
//! - [`error`]: Error types for all of the above

pub mod dial;
pub mod dial_service;
pub mod engine;
pub mod error;
pub mod filter;
pub mod killswitch;
pub mod provision;

#[cfg(test)]
pub mod test_helpers;

#[cfg(test)]
mod tests;
