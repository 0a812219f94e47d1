pub mod runner;
pub mod select;

pub use runner::{BatchRunner, StopHandle};
pub use select::BatchRequest;
