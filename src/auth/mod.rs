//! Identity, sessions and authorization.

pub mod guard;
pub mod middleware;
pub mod oidc;
pub mod session;

pub use guard::{authorize, ROLE_UPLOADER, ROLE_VIEWER};
pub use middleware::{CurrentSession, SessionContext};
pub use oidc::{OidcClient, Principal, TokenSet};
pub use session::{MemorySessionStore, RedisSessionStore, Session, SessionStore};
