//! Validates GPU mining hash kernels against CPU reference implementations.

pub mod algorithm;
pub mod algorithms;
pub mod backend;
pub mod config;
pub mod error;
pub mod kernels;
pub mod nonce;
pub mod resources;
pub mod runner;
pub mod scheduler;
pub mod signature;
pub mod special;
pub mod ui;
pub mod validation;
pub mod vectors;
