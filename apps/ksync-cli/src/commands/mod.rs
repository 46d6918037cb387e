pub mod cache;
pub mod config;
pub mod paths;
pub mod store;
pub mod sync;
pub mod util;

pub use cache::CacheCmd;
pub use config::ConfigCmd;
pub use paths::PathsArgs;
pub use store::StoreCmd;
pub use sync::SyncCmd;
