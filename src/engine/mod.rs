//! Worker pool engine: worker threads, worker processes, supervision, item
//! processors.

pub mod child;
pub mod counter;
pub mod pool;
pub mod processor;
pub mod worker;

pub use child::{ChildCommand, ChildProcessor, child_factory, serve};
pub use counter::CompletionCounter;
pub use pool::{PoolConfig, WorkerPool};
pub use processor::{
    CommandProcessor, CommandSpec, ProcessError, Processor, ProcessorFactory, RetryPolicy,
};
pub use worker::{WorkerExit, WorkerHandle};
