pub mod chunking;
pub mod lines;
pub mod providers;
pub mod router;
pub mod types;

pub use providers::build_providers;
pub use router::{EventStream, Generated, ProviderRouter, ProviderStatus, RouterConfig, RouterHealth};
pub use types::{GenerateParams, Generation, ProviderAdapter, ProviderError, ProviderKind, RouterError};
