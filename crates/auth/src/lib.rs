//! `mailforge-auth` — authentication/authorization boundary.
//!
//! Token decoding, claims validation, and the ownership rule live here,
//! decoupled from HTTP and storage. User/session management is out of
//! scope: verified claims come in, an [`Actor`] identity comes out.

pub mod actor;
pub mod claims;
pub mod roles;
pub mod token;

pub use actor::{Actor, ActorId};
pub use claims::{JwtClaims, TokenValidationError, validate_claims};
pub use roles::Role;
pub use token::{Hs256JwtValidator, JwtValidator, TokenError};
