use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{error, info};

use sinistra::compile;
use sinistra::config::{Config, DEFAULT_INPUT_ITEM, DEFAULT_ITEMSTORE, DEFAULT_PORT, DEFAULT_SRCROOT};
use sinistra::logging;
use sinistra::{Runtime, Store};

/// The Sinistra interpreter.
#[derive(Parser)]
#[command(name = "sin", version, about)]
struct Args {
  /// Run the boot item, then exit before the event loop.
  #[arg(long)]
  bootonly: bool,

  /// Itemstore file to load; created if it does not exist.
  #[arg(long, value_name = "FILE")]
  itemstore: Option<PathBuf>,

  /// Log to <FILE>.log and <FILE>.err instead of the terminal.
  #[arg(long, value_name = "FILE", num_args = 0..=1, default_missing_value = "sin")]
  log: Option<String>,

  /// Name of the item run by the input pump.
  #[arg(long, value_name = "ITEM", default_value = DEFAULT_INPUT_ITEM)]
  input: String,

  /// Object code to interpret.
  #[arg(long, value_name = "FILE")]
  object: PathBuf,

  /// Port to listen on.
  #[arg(long, value_name = "PORT", default_value_t = DEFAULT_PORT)]
  port: u16,

  /// Root of the source tree; must exist if given.
  #[arg(long, value_name = "DIR")]
  srcroot: Option<PathBuf>,
}

fn main() -> Result<()> {
  let args = Args::parse();
  logging::init(args.log.as_deref())?;

  let srcroot = match args.srcroot {
    Some(dir) => {
      if !dir.is_dir() {
        bail!("directory {} does not exist", dir.display());
      }
      dir
    }
    None => {
      let dir = PathBuf::from(DEFAULT_SRCROOT);
      if !dir.exists() {
        info!("creating new source root in current directory");
        fs::create_dir_all(&dir)
          .with_context(|| format!("unable to create {}", dir.display()))?;
      } else if !dir.is_dir() {
        bail!("./{} exists but it is not a directory", dir.display());
      }
      dir
    }
  };
  info!("using {} as the source root", srcroot.display());

  let itemstore = args
    .itemstore
    .unwrap_or_else(|| PathBuf::from(DEFAULT_ITEMSTORE));
  let store = if itemstore.exists() {
    info!("loading itemstore from {}", itemstore.display());
    Store::load(&itemstore)
      .with_context(|| format!("unable to load itemstore {}", itemstore.display()))?
  } else {
    info!(
      "creating a new itemstore, which will be saved as {}",
      itemstore.display()
    );
    Store::new()
  };

  let bytecode = fs::read(&args.object)
    .with_context(|| format!("unable to open input file {}", args.object.display()))?;
  info!("bytecode loaded: {} bytes", bytecode.len());

  let mut config = Config::new(itemstore.clone(), srcroot, args.input, args.port);
  config.bootonly = args.bootonly;
  let bootonly = config.bootonly;

  let rt = tokio::runtime::Builder::new_current_thread()
    .enable_all()
    .build()?;
  let local = tokio::task::LocalSet::new();
  let runtime = rt.block_on(local.run_until(async move {
    let mut runtime = Runtime::new(config, store, Box::new(compile::Unavailable));
    runtime.boot(bytecode);
    if !bootonly {
      if let Err(e) = runtime.run().await {
        error!("{e:#}");
      }
    }
    runtime
  }));

  // Only sys.abort skips the save.
  if runtime.shutdown_requested() == Some(false) {
    info!("itemstore not saved");
  } else if let Err(e) = runtime.store().save(&itemstore) {
    error!("failed to save itemstore: {e}");
  }
  Ok(())
}
