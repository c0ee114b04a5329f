//! The interpreter. Dispatches opcodes through the dense byte table
//! and drives item invocation, one virtual machine at a time.

use tracing::{debug, error, trace};

use crate::bytecode::{
  self, Op, DISPATCH, HEADER_SIZE, MARK_DEREF, MARK_DEREF_VAR, MARK_END, MARK_LAYER, MARK_PARAMS,
};
use crate::compile::Compiler;
use crate::config::Config;
use crate::error::ErrorKind;
use crate::item::source::{render_source, save_source_logged};
use crate::item::{self, ItemId, Store};
use crate::libcall::{self, Host};
use crate::value::{self, Value};
use crate::vm::{Frame, Unwind, Vm};

/// Everything one interpreter run needs, threaded explicitly: the
/// shared itemstore, the current virtual machine, and the host seams.
pub struct Interp<'a> {
  pub store: &'a mut Store,
  pub vm: &'a mut Vm,
  pub host: &'a mut dyn Host,
  pub compiler: &'a mut dyn Compiler,
  pub config: &'a Config,
}

fn truncated() -> Unwind {
  error!("bytecode ends mid-instruction");
  Unwind::BadBytecode
}

fn req_u8(code: &[u8], ip: usize) -> Result<u8, Unwind> {
  bytecode::read_u8(code, ip).ok_or_else(truncated)
}

fn req_u16(code: &[u8], ip: usize) -> Result<u16, Unwind> {
  bytecode::read_u16(code, ip).ok_or_else(truncated)
}

fn req_i16(code: &[u8], ip: usize) -> Result<i16, Unwind> {
  bytecode::read_i16(code, ip).ok_or_else(truncated)
}

fn req_i64(code: &[u8], ip: usize) -> Result<i64, Unwind> {
  bytecode::read_i64(code, ip).ok_or_else(truncated)
}

fn req_slice<'c>(code: &'c [u8], ip: usize, len: usize) -> Result<&'c [u8], Unwind> {
  code.get(ip..ip + len).ok_or_else(truncated)
}

impl<'a> Interp<'a> {
  /// Run a code item to HALT and return its value. The item is marked
  /// in use for the duration and released on every exit path; an
  /// `Unwind` propagates to the outermost caller, which is expected to
  /// rebuild the stacks (safe-point recovery).
  pub fn interpret(&mut self, id: ItemId) -> Result<Value, Unwind> {
    self.store.get_mut(id).inuse = true;
    let result = self.execute(id);
    self.store.get_mut(id).inuse = false;
    result
  }

  fn execute(&mut self, id: ItemId) -> Result<Value, Unwind> {
    let Some(code) = self.store.get(id).bytecode() else {
      error!("cannot execute {}: not a code item", self.store.full_name(id));
      return Ok(Value::Nil);
    };
    let Some(hdr) = bytecode::header(&code) else {
      error!("item {} has a malformed header", self.store.full_name(id));
      return Err(Unwind::BadBytecode);
    };

    // Parameters are already on the stack; rebase so they become the
    // first locals, then reserve the rest.
    let stack = &mut self.vm.stack;
    stack.base = stack.len().saturating_sub(hdr.params as usize);
    for _ in 0..hdr.locals - hdr.params {
      stack.push(Value::Nil)?;
    }
    stack.locals = hdr.locals;
    stack.params = hdr.params;
    debug!("making space for {} locals", hdr.locals);

    let code = code.as_slice();
    let mut ip = HEADER_SIZE;
    loop {
      let byte = req_u8(code, ip)?;
      if byte == b'h' {
        break;
      }
      ip = self.step(code, ip + 1, byte, id)?;
    }

    let depth = self.vm.stack.depth();
    if depth > 1 {
      error!("stack contains {depth} entries at end of interpretation");
    }
    if depth >= 1 {
      Ok(self.vm.stack.pop())
    } else {
      Ok(Value::Nil)
    }
  }

  /// Execute one instruction. `ip` points at the first operand byte;
  /// the returned ip is where execution resumes.
  fn step(&mut self, code: &[u8], ip: usize, byte: u8, item: ItemId) -> Result<usize, Unwind> {
    match DISPATCH[byte as usize] {
      Op::Nop => Ok(ip),
      Op::Undefined => {
        error!("undefined opcode: {byte:#04x}");
        Ok(ip)
      }
      // handled by the execute loop
      Op::Halt => Ok(ip),

      Op::PushInt => {
        let v = req_i64(code, ip)?;
        trace!("PUSH_INT {v}");
        self.vm.stack.push(Value::Int(v))?;
        Ok(ip + 8)
      }
      Op::PushStr => {
        let len = req_u16(code, ip)? as usize;
        let bytes = req_slice(code, ip + 2, len)?;
        let s = String::from_utf8_lossy(bytes).into_owned();
        trace!("PUSH_STR {s}");
        self.vm.stack.push(Value::Str(s))?;
        Ok(ip + 2 + len)
      }
      Op::GetLocal => {
        let index = req_u8(code, ip)?;
        match self.vm.stack.local(index) {
          Some(v) => {
            let v = v.clone();
            self.vm.stack.push(v)?;
          }
          None => {
            error!("local {index} is out of range");
            self.vm.stack.push(Value::Nil)?;
          }
        }
        Ok(ip + 1)
      }
      Op::SaveLocal => {
        let index = req_u8(code, ip)?;
        let v = self.vm.stack.pop();
        match self.vm.stack.local_mut(index) {
          Some(slot) => *slot = v,
          None => error!("local {index} is out of range"),
        }
        Ok(ip + 1)
      }
      Op::IncLocal => {
        let index = req_u8(code, ip)?;
        match self.vm.stack.local_mut(index) {
          Some(Value::Int(i)) => *i = i.wrapping_add(1),
          _ => error!("trying to increment non-integer local variable"),
        }
        Ok(ip + 1)
      }
      Op::DecLocal => {
        let index = req_u8(code, ip)?;
        match self.vm.stack.local_mut(index) {
          Some(Value::Int(i)) => *i = i.wrapping_sub(1),
          _ => error!("trying to decrement non-integer local variable"),
        }
        Ok(ip + 1)
      }

      Op::Add => self.binop(ip, value::add),
      Op::Subtract => self.binop(ip, value::subtract),
      Op::Multiply => self.binop(ip, value::multiply),
      Op::Divide => self.binop(ip, value::divide),
      Op::Negate => {
        match self.vm.stack.peek_mut() {
          Some(Value::Int(i)) => *i = i.wrapping_neg(),
          other => error!(
            "attempt to negate a value of type {}",
            other.map(|v| v.type_name()).unwrap_or("nothing")
          ),
        }
        Ok(ip)
      }

      Op::Equal => self.compare(ip, |lhs, rhs| value::equal(lhs, rhs)),
      Op::NotEqual => self.compare(ip, |lhs, rhs| !value::equal(lhs, rhs)),
      Op::Less => self.compare(ip, |lhs, rhs| {
        value::ordered(lhs, rhs) == Some(std::cmp::Ordering::Less)
      }),
      Op::Greater => self.compare(ip, |lhs, rhs| {
        value::ordered(lhs, rhs) == Some(std::cmp::Ordering::Greater)
      }),
      Op::LessEqual => self.compare(ip, |lhs, rhs| {
        matches!(
          value::ordered(lhs, rhs),
          Some(std::cmp::Ordering::Less | std::cmp::Ordering::Equal)
        )
      }),
      Op::GreaterEqual => self.compare(ip, |lhs, rhs| {
        matches!(
          value::ordered(lhs, rhs),
          Some(std::cmp::Ordering::Greater | std::cmp::Ordering::Equal)
        )
      }),

      Op::Not => {
        let v = self.vm.stack.pop();
        self.vm.stack.push(Value::Bool(!v.to_bool()))?;
        Ok(ip)
      }
      Op::And => {
        let rhs = self.vm.stack.pop().to_bool();
        let lhs = self.vm.stack.pop().to_bool();
        self.vm.stack.push(Value::Bool(lhs && rhs))?;
        Ok(ip)
      }
      Op::Or => {
        let rhs = self.vm.stack.pop().to_bool();
        let lhs = self.vm.stack.pop().to_bool();
        self.vm.stack.push(Value::Bool(lhs || rhs))?;
        Ok(ip)
      }

      Op::Jump => {
        let offset = req_i16(code, ip)?;
        self.jump_target(code, ip, offset)
      }
      Op::JumpIfFalse => {
        let v = self.vm.stack.pop();
        let truthy = match v {
          Value::Bool(b) => b,
          Value::Int(i) => i != 0,
          _ => false,
        };
        if truthy {
          Ok(ip + 2)
        } else {
          let offset = req_i16(code, ip)?;
          self.jump_target(code, ip, offset)
        }
      }

      Op::AssembleName => self.assemble(code, ip),
      Op::AssignItem => {
        let value = self.vm.stack.pop();
        let name = self.vm.stack.pop();
        self.assign_item(name, value);
        Ok(ip)
      }
      Op::AssignCodeItem => self.assign_code_item(code, ip),
      Op::FetchItem => self.fetch_item(code, ip, item),
      Op::DeleteItem => {
        match self.vm.stack.pop() {
          Value::Str(name) => {
            self.store.delete(&name);
          }
          other => error!("unable to delete item: invalid name type {}", other.type_name()),
        }
        Ok(ip)
      }
      Op::ExistsItem => {
        let exists = match self.vm.stack.pop() {
          Value::Str(name) => self.store.find(&name).is_some(),
          other => {
            error!("unable to test item: invalid name type {}", other.type_name());
            false
          }
        };
        self.vm.stack.push(Value::Bool(exists))?;
        Ok(ip)
      }

      Op::Libcall => {
        let lib = req_u8(code, ip)?;
        let func = req_u8(code, ip + 1)?;
        match libcall::by_index(lib, func) {
          Some(call) => (call.handler)(self)?,
          None => {
            error!("undefined library call {lib} {func}");
            self.vm.stack.push(Value::Nil)?;
          }
        }
        Ok(ip + 2)
      }
    }
  }

  fn binop(&mut self, ip: usize, f: fn(Value, Value) -> Value) -> Result<usize, Unwind> {
    let rhs = self.vm.stack.pop();
    let lhs = self.vm.stack.pop();
    self.vm.stack.push(f(lhs, rhs))?;
    Ok(ip)
  }

  fn compare(&mut self, ip: usize, f: impl Fn(&Value, &Value) -> bool) -> Result<usize, Unwind> {
    let rhs = self.vm.stack.pop();
    let lhs = self.vm.stack.pop();
    self.vm.stack.push(Value::Bool(f(&lhs, &rhs)))?;
    Ok(ip)
  }

  /// Offsets are signed and relative to the first operand byte.
  fn jump_target(&self, code: &[u8], ip: usize, offset: i16) -> Result<usize, Unwind> {
    let target = ip as i64 + offset as i64;
    if target < 0 || target as usize >= code.len() {
      error!("jump target {target} is outside the bytecode");
      return Err(Unwind::BadBytecode);
    }
    Ok(target as usize)
  }

  /// Given two values, use the first as the name of an item and the
  /// second as the value to assign to it. Values are either used or
  /// discarded here; the interpreter no longer cares.
  fn assign_item(&mut self, name: Value, value: Value) {
    match name {
      Value::Str(name) => {
        if self.store.insert_item(&name, value).is_none() {
          error!("unable to create item {name}");
        }
      }
      other => error!("unable to create item: invalid name type {}", other.type_name()),
    }
  }

  /// Item-name assembly: literal layers, local-variable substitution,
  /// and nested item dereferences, dot-joined. An invalid layer fails
  /// the whole assembly, which then pushes nil.
  fn assemble(&mut self, code: &[u8], mut ip: usize) -> Result<usize, Unwind> {
    let mut name = String::new();
    let mut invalid = false;
    loop {
      match req_u8(code, ip)? {
        MARK_END => {
          ip += 1;
          break;
        }
        MARK_LAYER => {
          let len = req_u8(code, ip + 1)? as usize;
          let bytes = req_slice(code, ip + 2, len)?;
          if !invalid {
            name.push_str(&String::from_utf8_lossy(bytes));
          }
          ip += 2 + len;
        }
        MARK_DEREF => match req_u8(code, ip + 1)? {
          MARK_DEREF_VAR => {
            let index = req_u8(code, ip + 2)?;
            ip += 3;
            match self.vm.stack.local(index) {
              Some(Value::Str(s)) => {
                if item::is_valid_layer(s) {
                  if !invalid {
                    name.push_str(s);
                  }
                } else {
                  error!("invalid layer name '{s}'");
                  invalid = true;
                }
              }
              Some(Value::Int(i)) => {
                if !invalid {
                  name.push_str(&i.to_string());
                }
              }
              other => {
                error!(
                  "layer type ({}) not int or string",
                  other.map(|v| v.type_name()).unwrap_or("nothing")
                );
                invalid = true;
              }
            }
          }
          b'I' => {
            ip = self.assemble(code, ip + 2)?;
            match self.vm.stack.pop() {
              Value::Str(layer_name) => match self.store.find(&layer_name) {
                Some(id) => match self.store.get(id).value() {
                  Some(Value::Str(s)) => {
                    if item::is_valid_layer(s) {
                      if !invalid {
                        name.push_str(s);
                      }
                    } else {
                      error!("invalid layer name '{s}'");
                      invalid = true;
                    }
                  }
                  Some(Value::Int(i)) => {
                    if !invalid {
                      name.push_str(&i.to_string());
                    }
                  }
                  _ => {
                    error!("item dereference failed for '{layer_name}': invalid type");
                    invalid = true;
                  }
                },
                None => {
                  error!("item dereference failed for '{layer_name}'");
                  invalid = true;
                }
              },
              other => {
                error!("invalid item layer type {}", other.type_name());
                invalid = true;
              }
            }
          }
          other => {
            error!("invalid dereference layer type {other:#04x}");
            return Err(Unwind::BadBytecode);
          }
        },
        other => {
          error!("invalid layer type {other:#04x}");
          return Err(Unwind::BadBytecode);
        }
      }
      // another layer follows, so add the dot separator
      if !invalid && req_u8(code, ip)? != MARK_END {
        name.push('.');
      }
    }
    if invalid {
      self.vm.stack.push(Value::Nil)?;
    } else {
      debug!("item assembled: {name}");
      self.vm.stack.push(Value::Str(name))?;
    }
    Ok(ip)
  }

  /// Fetching a value item pushes a copy of its value; fetching a code
  /// item saves the frame, adapts the arguments to the callee's
  /// declared parameters, and invokes the interpreter recursively.
  fn fetch_item(&mut self, code: &[u8], ip: usize, caller: ItemId) -> Result<usize, Unwind> {
    let argc = req_u8(code, ip)?;
    let ip = ip + 1;
    let name = self.vm.stack.pop();
    let Value::Str(name) = name else {
      error!("unable to fetch item: invalid name type {}", name.type_name());
      self.vm.stack.push(Value::Nil)?;
      return Ok(ip);
    };
    let Some(target) = self.store.find(&name) else {
      self.vm.stack.push(Value::Nil)?;
      return Ok(ip);
    };

    let Some(blob) = self.store.get(target).bytecode() else {
      // a value item: push a copy of its payload
      let v = self.store.get(target).value().cloned().unwrap_or(Value::Nil);
      self.vm.stack.push(v)?;
      return Ok(ip);
    };
    let Some(hdr) = bytecode::header(&blob) else {
      error!("item {name} has a malformed header");
      return Err(Unwind::BadBytecode);
    };

    // Adapt the caller's argument count to the callee's declared
    // parameters: extras are discarded newest-first, missing become nil.
    let params = hdr.params as usize;
    let mut have = argc as usize;
    while have > params {
      self.vm.stack.pop();
      have -= 1;
    }
    while have < params {
      self.vm.stack.push(Value::Nil)?;
      have += 1;
    }

    let frame = Frame {
      item: caller,
      ret_ip: ip,
      top: self.vm.stack.len().saturating_sub(params),
      base: self.vm.stack.base,
      locals: self.vm.stack.locals,
      params: self.vm.stack.params,
    };
    trace!("executing item {name} (call depth {})", self.vm.calls.len() + 1);
    self.vm.calls.push(frame)?;

    let ret = self.interpret(target)?;

    let Some(frame) = self.vm.calls.pop() else {
      error!("callstack underflow");
      return Err(Unwind::CallStackUnderflow);
    };
    self.vm.stack.truncate_to(frame.top);
    self.vm.stack.base = frame.base;
    self.vm.stack.locals = frame.locals;
    self.vm.stack.params = frame.params;
    self.vm.stack.push(ret)?;
    Ok(ip)
  }

  /// Compile embedded source and assign the result to the named code
  /// item, writing the reconstructed source under the source root. On
  /// failure the error item records which way it went.
  fn assign_code_item(&mut self, code: &[u8], mut ip: usize) -> Result<usize, Unwind> {
    let mut params = Vec::new();
    if req_u8(code, ip)? == MARK_PARAMS {
      ip += 1;
      loop {
        let len = req_u8(code, ip)? as usize;
        if len == 0 {
          ip += 2;
          break;
        }
        let bytes = req_slice(code, ip + 1, len)?;
        params.push(String::from_utf8_lossy(bytes).into_owned());
        ip += 1 + len;
      }
    }
    let len = req_u16(code, ip)? as usize;
    let source = String::from_utf8_lossy(req_slice(code, ip + 2, len)?).into_owned();
    ip += 2 + len;

    let name = self.vm.stack.pop();
    let Value::Str(name) = name else {
      error!("unable to assign code item: invalid name type {}", name.type_name());
      return Ok(ip);
    };

    debug!("source to compile: {source}");
    match self.compiler.compile(&source, &params) {
      Ok(blob) => match self.store.insert_code_item(&name, blob) {
        Some(id) => {
          self.store.set_error(ErrorKind::None);
          let full = self.store.full_name(id);
          save_source_logged(&self.config.srcroot, &full, &render_source(&params, &source));
        }
        None => self.store.set_error(ErrorKind::CompInUse),
      },
      Err(e) => {
        error!("compilation of item {name} failed: {e}");
        self.store.insert_item(&name, Value::Nil);
        self.store.set_error(e.kind);
      }
    }
    Ok(ip)
  }
}
