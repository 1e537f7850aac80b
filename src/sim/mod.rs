//! In-process implementations of both collaborator traits
//!
//! These back the test suite and the CLI's plan inspection; they are not a
//! filtering or dialing implementation. [`engine::MemoryEngine`] stores
//! rules by identity and can evaluate simulated packets with the engine's
//! matching semantics; [`dial::SimDialService`] replays a scripted
//! notification sequence on its own thread, the way the OS dial service
//! would.

pub mod dial;
pub mod engine;

pub use dial::{DialScript, SimDialService};
pub use engine::{MemoryEngine, SimPacket, Verdict};
