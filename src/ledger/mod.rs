pub mod memory;
pub mod models;
pub mod repository;
pub mod store;

pub use memory::MemoryOrderStore;
pub use repository::PgOrderStore;
pub use store::OrderStore;
