pub mod command;
pub mod handler;
pub mod pool;

pub use command::CommandHandler;
pub use handler::StageHandler;
pub use pool::{JobOutcome, WorkerConfig, WorkerPool};
