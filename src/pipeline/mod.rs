pub mod board;
pub mod refresh;
pub mod scheduler;
