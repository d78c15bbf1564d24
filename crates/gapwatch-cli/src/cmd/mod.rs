pub mod config;
pub mod consolidate;
pub mod key;
pub mod show;
pub mod tolerance;
