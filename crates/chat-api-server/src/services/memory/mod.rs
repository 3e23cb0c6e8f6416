pub mod client;
pub mod gateway;

pub use client::{MemoryBackend, MemoryError, ZepClient};
pub use gateway::{MemoryGateway, TurnRecord};
