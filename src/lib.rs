pub mod clipboard;
pub mod entry;
pub mod error;
pub mod otp;
pub mod prompt;
pub mod registry;
pub mod scheduler;
pub mod storage;
pub mod store;

pub use entry::{DEFAULT_PERIOD, TokenCollection, TokenRecord};
pub use error::StoreError;
