//! Authentication primitives: access tokens, salted hashing, refresh token material

pub mod jwt;
pub mod middleware;
pub mod password;
pub mod refresh;

pub use jwt::{Claims, JwtService};
pub use middleware::{extract_token, jwt_auth_middleware, AuthContext};
pub use password::PasswordHasher;
