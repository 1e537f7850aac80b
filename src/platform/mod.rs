//! OS backends for the collaborator traits
//!
//! The design assumes an OS-level filtering/dialing capability; on Windows
//! that is the filtering platform and the RAS dial subsystem, bound in
//! [`windows`]. Other platforms have no backend here; the traits are the
//! boundary, and [`crate::sim`] covers tests and plan inspection.

#[cfg(windows)]
pub mod windows;
