pub mod app;
pub mod render;

pub use app::{ChatCommand, Exit, ParleyApp};
