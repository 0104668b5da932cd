pub mod auth;
pub mod token;
pub mod totp;

pub use token::{AuthClaims, TokenService};
pub use totp::TotpService;
