pub mod health;
pub mod login;
pub mod register;
pub mod two_factor;

pub use health::health_check;
pub use login::login;
pub use register::register;
pub use two_factor::{get_two_fa_qr_code, register_two_fa};
