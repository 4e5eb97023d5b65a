pub mod api;
pub mod input;
