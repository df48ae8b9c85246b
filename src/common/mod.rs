pub mod bits;
pub mod crypto;
pub mod merkle;
