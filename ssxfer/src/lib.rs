#![doc = include_str!("../README.md")]

mod config;
mod error;
mod objstore;
mod planner;
mod pool;
mod progress;
mod transfer;

pub use config::Config;
pub use error::{Result, TransferError};
pub use objstore::{
    CompletedPart, ObjectRef, ObjectStorageClient, ObjectStorageFactory,
};
pub use planner::{plan, PartSpec, TransferPlan};
pub use progress::{
    ProgressAggregator, ProgressSnapshot, TransferProgressCallback, WorkerId,
};
pub use transfer::{Direction, TransferJob, TransferJobBuilder, TransferResult};
