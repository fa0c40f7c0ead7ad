pub mod assert;
pub mod error;
pub mod global_init;
pub mod linalg;
pub mod ndarray;
