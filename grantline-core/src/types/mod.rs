mod entitlement;
mod primitives;
mod request;
mod secret;

pub use entitlement::*;
pub use primitives::*;
pub use request::*;
pub use secret::*;
