pub mod admin;
pub mod core;
pub mod pool;
pub mod students;
pub mod validation;
