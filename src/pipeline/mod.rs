pub mod provider;

pub use provider::{FrameProvider, ProviderConfig, ProviderError, ProviderStats};
