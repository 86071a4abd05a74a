//! Crate-level error joining the per-subsystem errors.

use thiserror::Error;

use crate::assembler::AssemblyError;
use crate::binary::CodecError;
use crate::builder::BuildError;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("build error: {0}")]
    Build(#[from] BuildError),

    #[error("assembly error: {0}")]
    Assembly(#[from] AssemblyError),
}

pub type Result<T> = std::result::Result<T, Error>;
