pub mod agent;
pub mod chat;
pub mod conversation;
pub mod llm;
pub mod memory;

pub use agent::{ChatAgent, ChatModel};
pub use chat::ChatOrchestrator;
pub use conversation::ConversationStore;
pub use llm::ProviderRouter;
pub use memory::MemoryGateway;
