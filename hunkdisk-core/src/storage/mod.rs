//! Storage abstractions containers are opened against.
//!
//! - `StorageProxy`: byte-addressable handle exclusively owned by a container
//! - `StorageProvider`: maps locators to proxies
//! - `FileStorage`: local filesystem
//! - `MemoryStorage`: shared in-memory buffers with permission controls

mod file_storage;
mod memory_storage;
mod proxy;
mod reader;

pub use file_storage::{FileProxy, FileStorage};
pub use memory_storage::{MemoryProxy, MemoryStorage};
pub use proxy::{StorageProvider, StorageProxy};
pub(crate) use reader::ProxyReader;
