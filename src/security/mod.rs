pub mod access;
pub mod attempts;
pub mod bucket;
pub mod csrf;
pub mod gate;
pub mod identity;
pub mod recovery;
pub mod refresh;
pub mod store;
pub mod utils;

pub use access::{AccessTokenClaims, AccessTokenCodec, Role, TokenError};
pub use gate::{Collaborators, Gate, GateConfig, GateError, GateTasks};
