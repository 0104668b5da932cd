pub mod user;

pub use user::{TwoFactorStatus, User};
