pub mod chat;
pub mod events;

pub use chat::*;
pub use events::StreamEvent;
