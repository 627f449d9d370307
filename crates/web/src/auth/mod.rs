//! Authentication: access tokens, login lockout, TOTP and the
//! `CurrentUser` extractor.

pub mod extract;
pub mod jwt;
pub mod lockout;
pub mod routes;
pub mod totp;

pub use extract::{ClientIp, CurrentUser};
pub use jwt::{Claims, TokenIssuer};
pub use lockout::LoginAttemptTracker;
