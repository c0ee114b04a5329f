//! Log facility. By default events go to the terminal; with a log
//! stem, routine output goes to `<stem>.log` and warnings/errors to
//! `<stem>.err`, mirroring the stdout/stderr split of a classic
//! daemon.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::Level;
use tracing_subscriber::filter::{filter_fn, EnvFilter};
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

#[derive(Clone)]
struct SharedFile(Arc<File>);

impl Write for SharedFile {
  fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
    (&*self.0).write(buf)
  }

  fn flush(&mut self) -> io::Result<()> {
    (&*self.0).flush()
  }
}

fn open_log(path: &str) -> Result<SharedFile> {
  let file = OpenOptions::new()
    .create(true)
    .append(true)
    .open(path)
    .with_context(|| format!("unable to open logfile {path}"))?;
  Ok(SharedFile(Arc::new(file)))
}

pub fn init(stem: Option<&str>) -> Result<()> {
  let env_filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
  match stem {
    None => {
      tracing_subscriber::fmt().with_env_filter(env_filter()).init();
    }
    Some(stem) => {
      let out = open_log(&format!("{stem}.log"))?;
      let err = open_log(&format!("{stem}.err"))?;
      let out_layer = fmt::layer()
        .with_ansi(false)
        .with_writer(move || out.clone())
        .with_filter(filter_fn(|meta| *meta.level() > Level::WARN));
      let err_layer = fmt::layer()
        .with_ansi(false)
        .with_writer(move || err.clone())
        .with_filter(filter_fn(|meta| *meta.level() <= Level::WARN));
      tracing_subscriber::registry()
        .with(env_filter())
        .with(out_layer)
        .with(err_layer)
        .init();
    }
  }
  Ok(())
}
