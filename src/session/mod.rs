//! Client sessions

pub mod client;

pub use client::{Client, Role};
