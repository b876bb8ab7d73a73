//! # civ-bridge-core
//!
//! Core types shared by the Civ bridge crates.
//!
//! This crate provides the vocabulary used on both sides of the bridge:
//! - Error taxonomy and wire error codes
//! - Uniform call results
//! - External and Lua function registrations
//! - Game event records and batches

pub mod call;
pub mod error;
pub mod event;
pub mod function;

pub use call::CallResult;
pub use error::{BridgeError, ErrorPayload, Result, error_codes};
pub use event::{EventBatch, GameEventRecord};
pub use function::{
    DEFAULT_EXTERNAL_TIMEOUT_MS, ExternalFunction, ExternalFunctionSpec, LuaFunction,
};
