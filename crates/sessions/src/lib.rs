//! Session lifecycle: the agent-adapter boundary, tier-driven capability
//! policy, the durable session registry, and the `Session` type that wires
//! a subprocess to its sender/receiver task pair.

pub mod adapter;
pub mod policy;
pub mod registry;
pub mod session;
pub mod transcript;

pub use adapter::{AgentAdapter, AgentMessage, AgentStartOptions, ToolUse};
pub use registry::{derive_session_name, RegistryEntry, SessionRegistry, SessionType};
pub use session::Session;
pub use transcript::{TranscriptReader, TranscriptWriter};
