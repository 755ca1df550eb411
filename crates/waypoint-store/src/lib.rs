pub mod atomic;
pub mod file;
pub mod log_store;
pub mod memory;
pub mod pause;
pub mod wait_store;

pub use file::FileRunStorage;
pub use log_store::JsonlLogStore;
pub use memory::InMemoryRunStorage;
pub use pause::{FilePauseFlags, InMemoryPauseFlags};
pub use wait_store::{InMemoryWaitStore, SqliteWaitStore};
