//! Domain types for remotex.
//!
//! - `RemotexError` / `ValidationError`: the error taxonomy
//! - `BuildOptions`, `Engine`: what a client may ask of a build
//! - `BuildPolicy`: what the server allows

pub mod error;
pub mod options;

pub use error::{ErrorKind, RemotexError, Result, ValidationError};
pub use options::{BuildOptions, BuildPolicy, Engine};
