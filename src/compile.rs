//! The seam to the source-language compiler. The parser and lexer are
//! external collaborators: the runtime only needs something that turns
//! an embedded source snippet plus a parameter list into a bytecode
//! blob, or reports which way it failed.

use thiserror::Error;
use tracing::error;

use crate::error::ErrorKind;

#[derive(Debug, Error)]
#[error("{kind}")]
pub struct CompileError {
  pub kind: ErrorKind,
}

impl CompileError {
  pub fn new(kind: ErrorKind) -> CompileError {
    CompileError { kind }
  }
}

pub trait Compiler {
  /// Compile `source` with the given parameter names into a blob whose
  /// header declares `params.len()` parameters.
  fn compile(&mut self, source: &str, params: &[String]) -> Result<Vec<u8>, CompileError>;
}

/// Stands in when no language front end is linked. Every embedded
/// snippet is rejected; precompiled bytecode is unaffected.
pub struct Unavailable;

impl Compiler for Unavailable {
  fn compile(&mut self, _source: &str, _params: &[String]) -> Result<Vec<u8>, CompileError> {
    error!("no compiler is available for embedded source");
    Err(CompileError::new(ErrorKind::CompSyntax))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn unavailable_rejects_everything() {
    let err = Unavailable.compile("1 + 1", &[]).unwrap_err();
    assert_eq!(err.kind, ErrorKind::CompSyntax);
    assert_eq!(err.to_string(), "Syntax error.");
  }
}
