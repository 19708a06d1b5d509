pub mod auth;
pub mod classes;
pub mod core;
pub mod exam;
pub mod instructors;
pub mod progress;
pub mod students;
