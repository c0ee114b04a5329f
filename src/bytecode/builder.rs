//! A small chainable builder for bytecode blobs. The compiler proper
//! is an external collaborator; this exists so hosts, fixtures, and
//! tests can assemble programs without hand-counting offsets.

use crate::bytecode::{MARK_DEREF, MARK_DEREF_VAR, MARK_END, MARK_LAYER, MARK_PARAMS};

pub struct Builder {
  code: Vec<u8>,
}

impl Builder {
  pub fn new(locals: u8, params: u8) -> Builder {
    Builder {
      code: vec![locals, params],
    }
  }

  /// Current offset, useful for computing jump targets by hand.
  pub fn offset(&self) -> usize {
    self.code.len()
  }

  pub fn raw(mut self, byte: u8) -> Builder {
    self.code.push(byte);
    self
  }

  pub fn push_int(mut self, value: i64) -> Builder {
    self.code.push(b'p');
    self.code.extend_from_slice(&value.to_le_bytes());
    self
  }

  pub fn push_str(mut self, s: &str) -> Builder {
    self.code.push(b'l');
    self.code.extend_from_slice(&(s.len() as u16).to_le_bytes());
    self.code.extend_from_slice(s.as_bytes());
    self
  }

  pub fn get_local(mut self, index: u8) -> Builder {
    self.code.extend_from_slice(&[b'e', index]);
    self
  }

  pub fn save_local(mut self, index: u8) -> Builder {
    self.code.extend_from_slice(&[b'c', index]);
    self
  }

  pub fn inc_local(mut self, index: u8) -> Builder {
    self.code.extend_from_slice(&[b'f', index]);
    self
  }

  pub fn dec_local(mut self, index: u8) -> Builder {
    self.code.extend_from_slice(&[b'g', index]);
    self
  }

  pub fn add(self) -> Builder {
    self.raw(b'a')
  }

  pub fn subtract(self) -> Builder {
    self.raw(b's')
  }

  pub fn multiply(self) -> Builder {
    self.raw(b'm')
  }

  pub fn divide(self) -> Builder {
    self.raw(b'd')
  }

  pub fn negate(self) -> Builder {
    self.raw(b'n')
  }

  pub fn equal(self) -> Builder {
    self.raw(b'o')
  }

  pub fn not_equal(self) -> Builder {
    self.raw(b'q')
  }

  pub fn less(self) -> Builder {
    self.raw(b'r')
  }

  pub fn greater(self) -> Builder {
    self.raw(b't')
  }

  pub fn less_equal(self) -> Builder {
    self.raw(b'u')
  }

  pub fn greater_equal(self) -> Builder {
    self.raw(b'v')
  }

  pub fn logical_not(self) -> Builder {
    self.raw(b'x')
  }

  pub fn logical_and(self) -> Builder {
    self.raw(b'y')
  }

  pub fn logical_or(self) -> Builder {
    self.raw(b'z')
  }

  /// Offsets are relative to the first operand byte.
  pub fn jump(mut self, offset: i16) -> Builder {
    self.code.push(b'j');
    self.code.extend_from_slice(&offset.to_le_bytes());
    self
  }

  pub fn jump_if_false(mut self, offset: i16) -> Builder {
    self.code.push(b'k');
    self.code.extend_from_slice(&offset.to_le_bytes());
    self
  }

  pub fn begin_name(self) -> Builder {
    self.raw(b'I')
  }

  pub fn layer(mut self, layer: &str) -> Builder {
    self.code.push(MARK_LAYER);
    self.code.push(layer.len() as u8);
    self.code.extend_from_slice(layer.as_bytes());
    self
  }

  pub fn layer_local(mut self, index: u8) -> Builder {
    self.code.extend_from_slice(&[MARK_DEREF, MARK_DEREF_VAR, index]);
    self
  }

  /// A nested item dereference layer: follow with layers and
  /// `end_name`.
  pub fn begin_layer_item(mut self) -> Builder {
    self.code.extend_from_slice(&[MARK_DEREF, b'I']);
    self
  }

  pub fn end_name(self) -> Builder {
    self.raw(MARK_END)
  }

  /// Assemble a fully literal dotted name.
  pub fn name(mut self, layers: &[&str]) -> Builder {
    self = self.begin_name();
    for layer in layers {
      self = self.layer(layer);
    }
    self.end_name()
  }

  pub fn assign(self) -> Builder {
    self.raw(b'C')
  }

  pub fn assign_code(mut self, params: &[&str], source: &str) -> Builder {
    self.code.push(b'B');
    if !params.is_empty() {
      self.code.push(MARK_PARAMS);
      for param in params {
        self.code.push(param.len() as u8);
        self.code.extend_from_slice(param.as_bytes());
      }
      self.code.extend_from_slice(&[0, 0]);
    }
    self.code.extend_from_slice(&(source.len() as u16).to_le_bytes());
    self.code.extend_from_slice(source.as_bytes());
    self
  }

  pub fn fetch(mut self, argc: u8) -> Builder {
    self.code.extend_from_slice(&[b'F', argc]);
    self
  }

  pub fn delete(self) -> Builder {
    self.raw(b'W')
  }

  pub fn exists(self) -> Builder {
    self.raw(b'X')
  }

  pub fn libcall(mut self, lib: u8, func: u8) -> Builder {
    self.code.extend_from_slice(&[b'A', lib, func]);
    self
  }

  pub fn halt(mut self) -> Vec<u8> {
    self.code.push(b'h');
    self.code
  }

  pub fn build(self) -> Vec<u8> {
    self.code
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn encodes_header_and_immediates() {
    let code = Builder::new(1, 0).push_int(42).halt();
    assert_eq!(code[0], 1);
    assert_eq!(code[1], 0);
    assert_eq!(code[2], b'p');
    assert_eq!(i64::from_le_bytes(code[3..11].try_into().unwrap()), 42);
    assert_eq!(code[11], b'h');
  }

  #[test]
  fn encodes_literal_name() {
    let code = Builder::new(0, 0).name(&["foo", "bar"]).build();
    assert_eq!(
      code[2..].to_vec(),
      vec![b'I', b'L', 3, b'f', b'o', b'o', b'L', 3, b'b', b'a', b'r', b'E']
    );
  }

  #[test]
  fn encodes_code_assignment_with_params() {
    let code = Builder::new(0, 0).assign_code(&["a"], "a + 1").build();
    let mut expected = vec![b'B', b'P', 1, b'a', 0, 0];
    expected.extend_from_slice(&5u16.to_le_bytes());
    expected.extend_from_slice(b"a + 1");
    assert_eq!(code[2..].to_vec(), expected);
  }
}
