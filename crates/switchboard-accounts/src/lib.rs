pub mod account;
pub mod pool;
pub mod store;

pub use account::{Account, AccountSelectionSettings, PoolSnapshot, Settings};
pub use pool::{AccountPool, Selection};
pub use store::{AccountStore, AccountsError, JsonFileAccountStore};
