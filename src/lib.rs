pub mod config;
pub mod features;
pub mod frame;
pub mod geometry;
pub mod localization;
pub mod map;
pub mod mapping;
pub mod processing;
pub mod tracking;
