//! Authentication Module
//! Caller identity comes from HS256 bearer tokens; `sub` is the user id.

pub mod jwt;
pub mod middleware;
pub mod models;

pub use jwt::JwtHandler;
pub use middleware::{admin_middleware, auth_middleware};
pub use models::{Claims, Role};
