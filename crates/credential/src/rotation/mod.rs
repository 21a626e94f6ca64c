//! Credential rotation
//!
//! A persisted, four-phase state machine per identity. See
//! [`RotationController`] for the driver and [`Phase`] for the transitions.

pub mod controller;
pub mod error;
pub mod phase;
pub mod policy;
pub mod state;

pub use controller::RotationController;
pub use error::{RotationError, RotationResult};
pub use phase::{Phase, Step};
pub use policy::RotationPolicy;
pub use state::{Lease, RotationState};
