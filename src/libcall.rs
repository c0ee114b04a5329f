//! Library calls: pseudo-items which do interesting things. Always of
//! the form `lib.func(...)`, always consuming a fixed number of stack
//! values and pushing exactly one result.

use tracing::{error, info};

use crate::error::ErrorKind;
use crate::interpret::Interp;
use crate::net::LineEvent;
use crate::value::Value;
use crate::vm::Unwind;

/// The operations the host runtime provides to running bytecode:
/// timers, player lines, and process-level control. Keeping them
/// behind a trait keeps the interpreter runnable without a server.
pub trait Host {
  /// Register a timer firing first after `start_ms`, then every
  /// `repeat_ms` (zero means fire once). Returns the task id.
  fn spawn_task(&mut self, item: &str, start_ms: u64, repeat_ms: u64) -> u64;
  /// Cancel a task. The cancellation only prevents future firings.
  fn kill_task(&mut self, id: u64) -> bool;
  /// Advance the fair-queue cursor over the lines and report at most
  /// one pending event.
  fn poll_input(&mut self) -> Option<(usize, LineEvent)>;
  /// Enqueue text on a line's output buffer.
  fn write_line(&mut self, line: usize, text: &str);
  fn max_lines(&self) -> usize;
  /// Stop the event loop. `save` decides whether the itemstore is
  /// persisted on the way out.
  fn request_shutdown(&mut self, save: bool);
}

/// A host that ignores every request. Lets the interpreter run in
/// isolation, as the disassembler and the tests do.
pub struct NullHost;

impl Host for NullHost {
  fn spawn_task(&mut self, _item: &str, _start_ms: u64, _repeat_ms: u64) -> u64 {
    0
  }

  fn kill_task(&mut self, _id: u64) -> bool {
    false
  }

  fn poll_input(&mut self) -> Option<(usize, LineEvent)> {
    None
  }

  fn write_line(&mut self, _line: usize, _text: &str) {}

  fn max_lines(&self) -> usize {
    0
  }

  fn request_shutdown(&mut self, _save: bool) {}
}

pub type LibcallFn = fn(&mut Interp<'_>) -> Result<(), Unwind>;

pub struct Libcall {
  pub lib: &'static str,
  pub func: &'static str,
  pub lib_index: u8,
  pub func_index: u8,
  pub args: u8,
  pub handler: LibcallFn,
}

pub static LIBCALLS: &[Libcall] = &[
  Libcall { lib: "sys", func: "backup", lib_index: 1, func_index: 0, args: 0, handler: lc_sys_backup },
  Libcall { lib: "sys", func: "log", lib_index: 1, func_index: 1, args: 1, handler: lc_sys_log },
  Libcall { lib: "sys", func: "shutdown", lib_index: 1, func_index: 2, args: 0, handler: lc_sys_shutdown },
  Libcall { lib: "sys", func: "abort", lib_index: 1, func_index: 3, args: 0, handler: lc_sys_abort },
  Libcall { lib: "task", func: "newgametask", lib_index: 2, func_index: 0, args: 3, handler: lc_task_newgametask },
  Libcall { lib: "task", func: "killtask", lib_index: 2, func_index: 1, args: 1, handler: lc_task_killtask },
  Libcall { lib: "net", func: "input", lib_index: 3, func_index: 0, args: 0, handler: lc_net_input },
  Libcall { lib: "net", func: "write", lib_index: 3, func_index: 1, args: 2, handler: lc_net_write },
  Libcall { lib: "str", func: "capitalise", lib_index: 4, func_index: 0, args: 1, handler: lc_str_capitalise },
  Libcall { lib: "str", func: "upper", lib_index: 4, func_index: 1, args: 1, handler: lc_str_upper },
  Libcall { lib: "str", func: "lower", lib_index: 4, func_index: 2, args: 1, handler: lc_str_lower },
];

/// Lookup by name pair, as the compiler does when it sees
/// `lib.func(...)` in source.
pub fn lookup(lib: &str, func: &str) -> Option<&'static Libcall> {
  LIBCALLS.iter().find(|c| c.lib == lib && c.func == func)
}

/// Lookup by the index pair encoded in the LIBCALL instruction.
pub fn by_index(lib: u8, func: u8) -> Option<&'static Libcall> {
  LIBCALLS
    .iter()
    .find(|c| c.lib_index == lib && c.func_index == func)
}

/// Snapshot the itemstore to a timestamped sibling file.
fn lc_sys_backup(interp: &mut Interp<'_>) -> Result<(), Unwind> {
  let timestamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
  let backup = format!("{}_{}", interp.config.itemstore.display(), timestamp);
  if let Err(e) = interp.store.save(std::path::Path::new(&backup)) {
    error!("failed to back up itemstore to {backup}: {e}");
  }
  interp.vm.stack.push(Value::Nil)
}

fn lc_sys_log(interp: &mut Interp<'_>) -> Result<(), Unwind> {
  match interp.vm.stack.pop() {
    Value::Str(s) => info!("{s}"),
    Value::Int(i) => info!("{i}"),
    Value::Bool(b) => info!("{}", if b { "true" } else { "false" }),
    // one cannot logically output nil
    Value::Nil => {}
  }
  interp.vm.stack.push(Value::Nil)
}

fn lc_sys_shutdown(interp: &mut Interp<'_>) -> Result<(), Unwind> {
  info!("sys.shutdown called, shutting down");
  interp.host.request_shutdown(true);
  interp.vm.stack.push(Value::Nil)
}

fn lc_sys_abort(interp: &mut Interp<'_>) -> Result<(), Unwind> {
  info!("sys.abort called, immediate (and messy) shutdown");
  interp.host.request_shutdown(false);
  interp.vm.stack.push(Value::Nil)
}

/// `task.newgametask(name, start, repeat)`, intervals in tenths of a
/// second. Returns the new task id.
fn lc_task_newgametask(interp: &mut Interp<'_>) -> Result<(), Unwind> {
  let repeat = interp.vm.stack.pop();
  let start = interp.vm.stack.pop();
  let name = interp.vm.stack.pop();
  let (Value::Int(repeat), Value::Int(start), Value::Str(name)) = (repeat, start, name) else {
    interp.store.set_error(ErrorKind::RuntimeInvalidArgs);
    return interp.vm.stack.push(Value::Nil);
  };
  if interp.store.find(&name).is_none() {
    interp.store.set_error(ErrorKind::RuntimeNoSuchItem);
    return interp.vm.stack.push(Value::Nil);
  }
  // deciseconds to milliseconds
  let start_ms = start.max(0) as u64 * 100;
  let repeat_ms = repeat.max(0) as u64 * 100;
  let id = interp.host.spawn_task(&name, start_ms, repeat_ms);
  interp.vm.stack.push(Value::Int(id as i64))
}

fn lc_task_killtask(interp: &mut Interp<'_>) -> Result<(), Unwind> {
  let Value::Int(id) = interp.vm.stack.pop() else {
    interp.store.set_error(ErrorKind::RuntimeInvalidArgs);
    return interp.vm.stack.push(Value::Nil);
  };
  let killed = id >= 0 && interp.host.kill_task(id as u64);
  interp.vm.stack.push(Value::Bool(killed))
}

/// Called by the input pump. Reports one event per call: 1 connected,
/// 2 disconnected, 3 data, 0 nothing pending. The line number (and for
/// data, the text) land in the configured input items first.
fn lc_net_input(interp: &mut Interp<'_>) -> Result<(), Unwind> {
  match interp.host.poll_input() {
    None => interp.vm.stack.push(Value::Int(0)),
    Some((line, event)) => {
      interp
        .store
        .set_item(&interp.config.input_line, Value::Int(line as i64));
      let code = match event {
        LineEvent::Connected => 1,
        LineEvent::Disconnected => 2,
        LineEvent::Data(text) => {
          interp
            .store
            .set_item(&interp.config.input_text, Value::Str(text));
          3
        }
      };
      interp.vm.stack.push(Value::Int(code))
    }
  }
}

/// `net.write(line, value)` encodes the value as text and enqueues it.
fn lc_net_write(interp: &mut Interp<'_>) -> Result<(), Unwind> {
  let out = interp.vm.stack.pop();
  let Value::Int(line) = interp.vm.stack.pop() else {
    interp.store.set_error(ErrorKind::RuntimeInvalidArgs);
    return interp.vm.stack.push(Value::Nil);
  };
  if line < 0 || line as usize >= interp.host.max_lines() {
    interp.store.set_error(ErrorKind::RuntimeInvalidArgs);
    return interp.vm.stack.push(Value::Nil);
  }
  match out {
    Value::Str(s) => interp.host.write_line(line as usize, &s),
    Value::Int(i) => interp.host.write_line(line as usize, &i.to_string()),
    Value::Bool(b) => interp
      .host
      .write_line(line as usize, if b { "true" } else { "false" }),
    // nothing to output
    Value::Nil => {}
  }
  interp.vm.stack.push(Value::Nil)
}

fn mutate_str_top(interp: &mut Interp<'_>, f: impl FnOnce(&mut String)) -> Result<(), Unwind> {
  if let Some(Value::Str(s)) = interp.vm.stack.peek_mut() {
    f(s);
    return Ok(());
  }
  interp.vm.stack.pop();
  interp.store.set_error(ErrorKind::RuntimeInvalidArgs);
  interp.vm.stack.push(Value::Nil)
}

fn lc_str_capitalise(interp: &mut Interp<'_>) -> Result<(), Unwind> {
  mutate_str_top(interp, |s| {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    if let Some(first) = chars.next() {
      out.extend(first.to_uppercase());
      out.push_str(chars.as_str());
      *s = out;
    }
  })
}

fn lc_str_upper(interp: &mut Interp<'_>) -> Result<(), Unwind> {
  mutate_str_top(interp, |s| *s = s.to_uppercase())
}

fn lc_str_lower(interp: &mut Interp<'_>) -> Result<(), Unwind> {
  mutate_str_top(interp, |s| *s = s.to_lowercase())
}
