#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! # Bastion Credential
//!
//! Zero-downtime key-pair rotation for platform service identities.
//!
//! A rotation walks four phases, each resumable from persisted state:
//!
//! 1. **createSecret**: generate a key pair and store it staged PENDING
//! 2. **setSecret**: authorize the pending public key next to the current one
//! 3. **testSecret**: authenticate with the pending key, retrying a bounded
//!    number of times before rolling back
//! 4. **finishSecret**: promote pending to CURRENT and retire the old key
//!
//! The old key keeps working until finishSecret, so clients never see an
//! outage. A per-identity lease in the [`CredentialStore`] keeps two
//! controllers from rotating the same identity at once.
//!
//! ```rust,ignore
//! let controller = RotationController::new(store, platform, policy, passphrase)?;
//! controller.bootstrap(&identity).await?;
//! let state = controller.rotate(&identity, &CancellationToken::new()).await?;
//! ```

pub mod credential;
pub mod keygen;
pub mod memory;
pub mod rotation;
pub mod store;

pub use credential::{Credential, SecretPayload, Stage, VersionId};
pub use keygen::{GeneratedKey, KeyGenError, KeyGenerator};
pub use memory::{CredentialStoreSnapshot, IdentityRecord, InMemoryCredentialStore, StoreOp};
pub use rotation::{
    Lease, Phase, RotationController, RotationError, RotationPolicy, RotationResult, RotationState,
    Step,
};
pub use store::{CredentialStore, StoreError, StoreResult};
