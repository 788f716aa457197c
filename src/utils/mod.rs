pub mod code;
pub mod error;
pub mod score;
