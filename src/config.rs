use std::path::PathBuf;

pub const DEFAULT_PORT: u16 = 4001;
pub const DEFAULT_MAXCONNS: usize = 50;
pub const DEFAULT_INPUT_ITEM: &str = "input";
pub const DEFAULT_ITEMSTORE: &str = "items.dat";
pub const DEFAULT_SRCROOT: &str = "srcroot";

/// Runtime configuration, threaded explicitly through the interpreter
/// and the host rather than living in a global.
#[derive(Clone, Debug)]
pub struct Config {
  /// Filename of the on-disk itemstore.
  pub itemstore: PathBuf,
  /// Root of the reconstructed-source tree.
  pub srcroot: PathBuf,
  /// Name of the item run by the input pump.
  pub input: String,
  /// Item set to the active line number before an input event.
  pub input_line: String,
  /// Item set to the received text before a data event.
  pub input_text: String,
  pub port: u16,
  pub maxconns: usize,
  /// Run the boot item, then exit before the event loop.
  pub bootonly: bool,
}

impl Config {
  pub fn new(itemstore: PathBuf, srcroot: PathBuf, input: String, port: u16) -> Config {
    let input_line = format!("{input}.line");
    let input_text = format!("{input}.text");
    Config {
      itemstore,
      srcroot,
      input,
      input_line,
      input_text,
      port,
      maxconns: DEFAULT_MAXCONNS,
      bootonly: false,
    }
  }
}

impl Default for Config {
  fn default() -> Config {
    Config::new(
      PathBuf::from(DEFAULT_ITEMSTORE),
      PathBuf::from(DEFAULT_SRCROOT),
      DEFAULT_INPUT_ITEM.to_string(),
      DEFAULT_PORT,
    )
  }
}
