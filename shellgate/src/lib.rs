//! Command-line front end for the shellgate connection proxy.

pub mod cli;
pub mod error;
pub mod serve;
pub mod signals;
