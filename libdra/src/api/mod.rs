pub mod store;
pub mod xlinestore;

pub use store::{ResourceStore, StoreError};
pub use xlinestore::{XlineOptions, XlineStore};
