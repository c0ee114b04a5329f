use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use sinistra::bytecode::disasm::Disassembly;

/// The Sinistra bytecode disassembler.
#[derive(Parser)]
#[command(name = "sdiss", version, about)]
struct Args {
  /// Object code to disassemble.
  #[arg(long, short, value_name = "FILE")]
  object: PathBuf,
}

fn main() -> Result<()> {
  let args = Args::parse();
  let bytecode = fs::read(&args.object)
    .with_context(|| format!("unable to open input file {}", args.object.display()))?;
  println!("bytecode loaded: {} bytes", bytecode.len());
  print!("{}", Disassembly::new(&bytecode));
  Ok(())
}
