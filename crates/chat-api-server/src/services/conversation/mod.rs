pub mod store;

pub use store::{CachePolicy, ConversationStore};
