pub mod crypto;
pub mod ip;
pub mod token;
