//! Core abstractions and interfaces for cfscope
//!
//! This module provides the descriptor contract, the request types, and the
//! collaborator traits the rest of the engine is built on.

pub mod clock;
pub mod context;
pub mod descriptor;
pub mod error;
pub mod traits;

// Re-export commonly used types
pub use clock::{Clock, ManualClock, SystemClock};
pub use context::{IncomingRequest, RequestContext};
pub use descriptor::{ApplicationDescriptor, DescriptorSettings, Signal};
pub use error::{
    BoxError, CallbackResult, ErrorKind, LifecycleError, LifecycleResult, Phase,
};
pub use traits::*;
