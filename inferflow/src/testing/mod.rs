//! Test doubles and fixtures shared across the suite.
//!
//! Public so embedders can drive the engine in their own tests without
//! standing up real backends.

mod fixtures;
mod mocks;

pub use fixtures::{sample_floor, sample_payload, sample_target};
pub use mocks::{
    ContentiousDocumentStore, FailingAssetStore, ScriptedInferenceClient, StallingDocumentStore,
};
