//! Character agents.
//!
//! Each major character is an independent agent with its own dossier, style
//! and memory. Agents only ever see the information packet routed to them.

mod character;
mod dossier;
mod manager;
mod response;
mod state;

pub use character::{respond, InvokeOptions};
pub use dossier::{Dossier, SpecialPerception, StyleCard, StyleUpdate};
pub use manager::AgentManager;
pub use response::{CharacterMove, CharacterResponse, Intent, ResponseWire};
pub use state::{AgentState, LongTermMemory, TurnMemory};
