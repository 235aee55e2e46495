//! Command-line interface of `zonetrace-capture`

pub mod args;

pub use args::Args;
