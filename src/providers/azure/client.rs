mod core;
pub mod pipelines;

pub use self::core::AzureClient;
