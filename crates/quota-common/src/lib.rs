//! Shared types for the OpenQuota engine
//!
//! Two concerns live here so that every crate in the workspace agrees on
//! them: the error taxonomy (configuration/integrity defects only — decision
//! outcomes are data, never errors) and the domain-event boundary consumed by
//! downstream subsystems such as webhook delivery.

#![warn(missing_docs)]

pub mod error;
pub mod events;

pub use error::{EngineError, EngineResult};
pub use events::{DomainEvent, EventBuffer, EventMetadata, EventSink, NullSink};
