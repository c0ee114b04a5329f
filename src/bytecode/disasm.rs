use std::fmt::{self, Display};

use crate::bytecode::{
  self, Op, DISPATCH, HEADER_SIZE, MARK_DEREF, MARK_DEREF_VAR, MARK_END, MARK_LAYER, MARK_PARAMS,
};
use crate::libcall;

/// Renders a bytecode blob as one instruction per line, offsets
/// counted from the first byte after the header.
pub struct Disassembly<'a> {
  code: &'a [u8],
}

impl<'a> Disassembly<'a> {
  pub fn new(code: &'a [u8]) -> Disassembly<'a> {
    Disassembly { code }
  }
}

impl Display for Disassembly<'_> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let Some(hdr) = bytecode::header(self.code) else {
      return writeln!(f, "not a bytecode blob");
    };
    writeln!(f, "locals: {}, params: {}", hdr.locals, hdr.params)?;

    let code = self.code;
    let mut ip = HEADER_SIZE;
    macro_rules! bail {
      ($at:expr) => {{
        writeln!(f, "{:05} | <truncated>", $at)?;
        return Ok(());
      }};
    }

    while ip < code.len() {
      let at = ip - HEADER_SIZE;
      let op = DISPATCH[code[ip] as usize];
      let byte = code[ip];
      ip += 1;
      match op {
        Op::Halt => {
          writeln!(f, "{at:05} | HALT")?;
          return Ok(());
        }
        Op::PushInt => match bytecode::read_i64(code, ip) {
          Some(v) => {
            writeln!(f, "{at:05} | PUSH_INT {v}")?;
            ip += 8;
          }
          None => bail!(at),
        },
        Op::PushStr => {
          let Some(len) = bytecode::read_u16(code, ip) else {
            bail!(at)
          };
          ip += 2;
          let Some(bytes) = code.get(ip..ip + len as usize) else {
            bail!(at)
          };
          writeln!(f, "{at:05} | PUSH_STR \"{}\"", String::from_utf8_lossy(bytes))?;
          ip += len as usize;
        }
        Op::GetLocal | Op::SaveLocal | Op::IncLocal | Op::DecLocal | Op::FetchItem => {
          let Some(index) = bytecode::read_u8(code, ip) else {
            bail!(at)
          };
          writeln!(f, "{at:05} | {} {index}", op.name())?;
          ip += 1;
        }
        Op::Jump | Op::JumpIfFalse => {
          let Some(offset) = bytecode::read_i16(code, ip) else {
            bail!(at)
          };
          writeln!(f, "{at:05} | {} {offset:+}", op.name())?;
          ip += 2;
        }
        Op::Libcall => {
          let (Some(lib), Some(func)) =
            (bytecode::read_u8(code, ip), bytecode::read_u8(code, ip + 1))
          else {
            bail!(at)
          };
          ip += 2;
          match libcall::by_index(lib, func) {
            Some(call) => {
              writeln!(f, "{at:05} | LIBCALL {lib} {func}; {}.{}", call.lib, call.func)?
            }
            None => writeln!(f, "{at:05} | LIBCALL {lib} {func}; <unknown>")?,
          }
        }
        Op::AssembleName => match render_assembly(code, ip) {
          Some((text, next)) => {
            writeln!(f, "{at:05} | ITEM {text}")?;
            ip = next;
          }
          None => bail!(at),
        },
        Op::AssignCodeItem => match render_code_assignment(code, ip) {
          Some((text, next)) => {
            writeln!(f, "{at:05} | {text}")?;
            ip = next;
          }
          None => bail!(at),
        },
        Op::Undefined => {
          writeln!(f, "{at:05} | UNDEFINED {byte:#04x}")?;
        }
        _ => {
          writeln!(f, "{at:05} | {}", op.name())?;
        }
      }
    }
    writeln!(f, "<missing HALT>")
  }
}

fn render_assembly(code: &[u8], mut ip: usize) -> Option<(String, usize)> {
  let mut parts = Vec::new();
  loop {
    match *code.get(ip)? {
      MARK_END => {
        ip += 1;
        break;
      }
      MARK_LAYER => {
        ip += 1;
        let len = *code.get(ip)? as usize;
        ip += 1;
        let bytes = code.get(ip..ip + len)?;
        parts.push(String::from_utf8_lossy(bytes).into_owned());
        ip += len;
      }
      MARK_DEREF => {
        ip += 1;
        match *code.get(ip)? {
          MARK_DEREF_VAR => {
            ip += 1;
            let index = *code.get(ip)?;
            ip += 1;
            parts.push(format!("{{local {index}}}"));
          }
          b'I' => {
            ip += 1;
            let (nested, next) = render_assembly(code, ip)?;
            parts.push(format!("{{item {nested}}}"));
            ip = next;
          }
          _ => return None,
        }
      }
      _ => return None,
    }
  }
  Some((parts.join("."), ip))
}

fn render_code_assignment(code: &[u8], mut ip: usize) -> Option<(String, usize)> {
  let mut params = Vec::new();
  if *code.get(ip)? == MARK_PARAMS {
    ip += 1;
    loop {
      let len = *code.get(ip)? as usize;
      if len == 0 {
        ip += 2;
        break;
      }
      ip += 1;
      let bytes = code.get(ip..ip + len)?;
      params.push(String::from_utf8_lossy(bytes).into_owned());
      ip += len;
    }
  }
  let len = bytecode::read_u16(code, ip)? as usize;
  ip += 2;
  let source = code.get(ip..ip + len)?;
  ip += len;
  let source = String::from_utf8_lossy(source);
  let text = if params.is_empty() {
    format!("ASSIGN_CODE_ITEM \"{source}\"")
  } else {
    format!("ASSIGN_CODE_ITEM {{ {} }} \"{source}\"", params.join(", "))
  };
  Some((text, ip))
}
