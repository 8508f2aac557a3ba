pub mod memory;
pub mod traits;

pub use memory::{InMemoryCertificateStore, InMemoryDirectory, InMemoryPayloadStore, InMemorySerialStore};
pub use traits::*;
