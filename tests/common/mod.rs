//! Shared test fixtures: in-memory fakes for every external seam.

pub mod mock_bus;
pub mod mock_kv;
pub mod mock_store;

pub use mock_bus::{MemoryBus, MemoryDeadLetters};
pub use mock_kv::MockKv;
pub use mock_store::MemoryDispatchStore;
