pub mod orchestrator;
pub mod title;

pub use orchestrator::{ChatOrchestrator, ChatTurn, TurnStream};
pub use title::{derive_title, spawn_title_generation};
