#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! # Bastion Core
//!
//! Vocabulary shared by the grant reconciler and the rotation controller.
//!
//! ## Key Components
//!
//! - **Identifiers**: [`RoleName`], [`IdentityId`], [`DatabaseName`], validated
//!   and folded to upper case the way the platform stores them
//! - **Grant model**: [`GrantEdge`], [`Privilege`], [`AccessLevel`]
//! - **Key material**: [`PublicKeyPem`], [`PrivateKey`], [`Fingerprint`]
//! - **Platform seam**: [`PlatformClient`] and its error type, plus
//!   [`InMemoryPlatform`] for local runs and tests

pub mod grant;
pub mod id;
pub mod key;
pub mod memory;
pub mod platform;

pub use grant::{AccessLevel, GrantEdge, Privilege};
pub use id::{DatabaseName, IdentifierError, IdentityId, RoleName};
pub use key::{Fingerprint, KeyError, PrivateKey, PublicKeyPem};
pub use memory::{InMemoryPlatform, PlatformCall, PlatformOp, PlatformSnapshot};
pub use platform::{PlatformClient, PlatformError, PlatformResult};
