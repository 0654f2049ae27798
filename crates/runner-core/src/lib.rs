//! Storage, configuration, and result-callback primitives for the ensemble
//! runner.
//!
//! The scheduler in `ensrun-engine` treats everything in this crate as an
//! external collaborator: ensembles are written to through the [`Ensemble`]
//! trait, runpath outputs are read through the [`config`] traits, and the
//! glue between the two is [`callbacks::forward_model_ok`].

#![forbid(unsafe_code)]
#![deny(unreachable_pub)]

pub mod callbacks;
pub mod config;
pub mod load;
pub mod run_arg;
pub mod storage;

pub use load::{LoadResult, LoadStatus};
pub use run_arg::RunArg;
pub use storage::{
    Dataset, Ensemble, Experiment, MemoryStorage, RealizationState, Storage, StorageError,
};
