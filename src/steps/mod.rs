// SPDX-License-Identifier: MIT

//! Built-in step kinds
//!
//! - `echo` - returns a fixed value or its input and dependency outputs
//! - `shell` - runs a command through `sh -c`
//! - `http` - issues an HTTP request with reqwest

pub mod echo;
pub mod http;
pub mod shell;

pub use echo::EchoStep;
pub use http::HttpStep;
pub use shell::ShellStep;
