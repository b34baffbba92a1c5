pub mod admission;
pub mod model;
pub mod pg;
pub mod store;

pub use admission::TaskScheduler;
pub use model::{NewTask, Task, TaskStatus, TaskType, MAX_PRIORITY, MIN_PRIORITY};
pub use pg::PgTaskStore;
pub use store::{InMemoryTaskStore, TaskStore};
