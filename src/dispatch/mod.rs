pub mod base_dispatcher;
pub mod height_queue;
pub mod serial_dispatcher;
pub mod task_runner;

pub use base_dispatcher::{BaseBlockDispatcher, FlushCadence};
pub use height_queue::HeightQueue;
pub use serial_dispatcher::SerialBlockDispatcher;
pub use task_runner::{BoxedTask, OrderedTaskRunner, TaskOutcome};
