pub mod answers;
pub mod lifecycle;
