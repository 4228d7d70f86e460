pub mod scoring;
pub mod selection;
