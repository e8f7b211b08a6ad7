#![deny(unused_must_use)]

extern crate core;

mod f64_utils;
pub mod config;
pub mod crs;
pub mod dispatcher;
pub mod error;
pub mod geometry;
pub mod io;
mod lru_cache;
pub mod node;
pub mod node_store;
pub mod pipeline;
pub mod tile_encoder;
pub mod tileset;
pub mod worker_pool;

pub use nalgebra;
