pub mod common;
pub mod configs;
pub mod monitoring;
pub mod video;
