pub mod digest;
pub mod error;
pub mod memory;
pub mod store;

pub use digest::compute_spec_digest;
pub use error::StoreError;
pub use memory::InMemoryStore;
pub use store::{ChangeOp, Resource, ResourceChange, Store};
