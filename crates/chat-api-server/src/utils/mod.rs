pub mod error;

pub use error::{user_facing_message, ApiError, StoreError};
