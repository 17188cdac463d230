pub mod event_log;
pub mod memory_store;
pub mod pool;
pub mod session_store;
