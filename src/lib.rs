#[macro_use]
extern crate tracing;

pub mod camera;
pub mod capture;
pub mod cli;
pub mod config;
pub mod geometry;
pub mod mission;
pub mod observation;
pub mod perception;
pub mod state;
pub mod task;
pub mod upload;
pub mod util;
pub mod vehicle;
