pub mod cache;
pub mod priority_queue;

pub use cache::{AssignmentCache, MemoryAssignmentCache};
pub use priority_queue::PriorityQueueService;
