//! Property-based tests module.

mod classes;
