//! Every code item assigned at runtime leaves a readable trace: a
//! reconstructed source file under the source root, one directory per
//! layer.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, error};

/// `<srcroot>/<layer>/<layer>/…/source.sin`
pub fn source_path(srcroot: &Path, full_name: &str) -> PathBuf {
  let mut path = srcroot.to_path_buf();
  for layer in full_name.split('.') {
    path.push(layer);
  }
  path.push("source.sin");
  path
}

/// `code { a, b } (body);` or `code (body);` when there are no
/// parameters.
pub fn render_source(params: &[String], body: &str) -> String {
  if params.is_empty() {
    format!("code ({body});\n")
  } else {
    format!("code {{ {} }} ({body});\n", params.join(", "))
  }
}

/// Write the reconstructed source for an item, creating intermediate
/// directories on demand. Failures are logged, never fatal.
pub fn save_source(srcroot: &Path, full_name: &str, text: &str) -> io::Result<()> {
  let path = source_path(srcroot, full_name);
  if let Some(dir) = path.parent() {
    fs::create_dir_all(dir)?;
  }
  fs::write(&path, text)?;
  debug!("source for {full_name} written to {}", path.display());
  Ok(())
}

/// As `save_source`, but degrade errors to a log line.
pub fn save_source_logged(srcroot: &Path, full_name: &str, text: &str) {
  if let Err(e) = save_source(srcroot, full_name, text) {
    error!("failed to write source for {full_name}: {e}");
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn path_mirrors_layers() {
    let path = source_path(Path::new("srcroot"), "game.tick.fast");
    assert_eq!(
      path,
      Path::new("srcroot").join("game").join("tick").join("fast").join("source.sin")
    );
  }

  #[test]
  fn renders_with_and_without_params() {
    assert_eq!(render_source(&[], "1 + 2"), "code (1 + 2);\n");
    assert_eq!(
      render_source(&["a".to_string(), "b".to_string()], "a + b"),
      "code { a, b } (a + b);\n"
    );
  }

  #[test]
  fn writes_through_missing_directories() {
    let dir = tempfile::tempdir().unwrap();
    save_source(dir.path(), "a.b.c", "code (0);\n").unwrap();
    let written = std::fs::read_to_string(source_path(dir.path(), "a.b.c")).unwrap();
    assert_eq!(written, "code (0);\n");
  }
}
