mod aggregate;
mod core;
mod export;

pub use self::core::AzureProvider;
