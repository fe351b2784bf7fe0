mod cache;
mod client;
mod filters;
mod provider;
pub mod stage_type;
mod stats;

pub use cache::SystemClock;
pub use filters::DashboardParams;
pub use provider::AzureProvider;
