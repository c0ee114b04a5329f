//! The wire/disk layout of programs. A blob begins with two header
//! bytes (`locals`, `params`), execution starts at offset 2 and ends at
//! the HALT opcode. Opcodes are single bytes with inline immediates.

pub mod builder;
pub mod disasm;

/// Structural marker bytes used inside `BEGIN_ITEM_ASSEMBLY` and
/// `ASSIGN_CODE_ITEM` operands. Not opcodes.
pub const MARK_LAYER: u8 = b'L';
pub const MARK_DEREF: u8 = b'D';
pub const MARK_DEREF_VAR: u8 = b'V';
pub const MARK_END: u8 = b'E';
pub const MARK_PARAMS: u8 = b'P';

pub const HEADER_SIZE: usize = 2;

macro_rules! opcodes {
  ($($byte:literal => $snake:ident, $mnemonic:literal;)*) => {
    paste::paste! {
      #[derive(Clone, Copy, Debug, PartialEq, Eq)]
      pub enum Op {
        $([<$snake:camel>],)*
        Undefined,
      }

      /// Dense byte-to-opcode table. Every byte not claimed below
      /// resolves to `Undefined`, whose handler logs and moves on.
      pub const DISPATCH: [Op; 256] = {
        let mut table = [Op::Undefined; 256];
        $(table[$byte as usize] = Op::[<$snake:camel>];)*
        table
      };

      impl Op {
        pub fn name(self) -> &'static str {
          match self {
            $(Op::[<$snake:camel>] => $mnemonic,)*
            Op::Undefined => "UNDEFINED",
          }
        }
      }
    }
  };
}

opcodes! {
  0x00 => nop, "NOP";
  b'a' => add, "ADD";
  b'c' => save_local, "SAVE_LOCAL";
  b'd' => divide, "DIVIDE";
  b'e' => get_local, "GET_LOCAL";
  b'f' => inc_local, "INC_LOCAL";
  b'g' => dec_local, "DEC_LOCAL";
  b'h' => halt, "HALT";
  b'j' => jump, "JUMP";
  b'k' => jump_if_false, "JUMP_IF_FALSE";
  b'l' => push_str, "PUSH_STR";
  b'm' => multiply, "MULTIPLY";
  b'n' => negate, "NEGATE";
  b'o' => equal, "EQUAL";
  b'p' => push_int, "PUSH_INT";
  b'q' => not_equal, "NOT_EQUAL";
  b'r' => less, "LESS";
  b's' => subtract, "SUBTRACT";
  b't' => greater, "GREATER";
  b'u' => less_equal, "LESS_EQUAL";
  b'v' => greater_equal, "GREATER_EQUAL";
  b'x' => not, "NOT";
  b'y' => and, "AND";
  b'z' => or, "OR";
  b'A' => libcall, "LIBCALL";
  b'B' => assign_code_item, "ASSIGN_CODE_ITEM";
  b'C' => assign_item, "ASSIGN_ITEM";
  b'F' => fetch_item, "FETCH_ITEM";
  b'I' => assemble_name, "BEGIN_ITEM_ASSEMBLY";
  b'W' => delete_item, "DELETE";
  b'X' => exists_item, "EXISTS";
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
  pub locals: u8,
  pub params: u8,
}

/// Read and validate the two header bytes: `0 <= params <= locals`.
pub fn header(code: &[u8]) -> Option<Header> {
  if code.len() < HEADER_SIZE {
    return None;
  }
  let (locals, params) = (code[0], code[1]);
  if params > locals {
    return None;
  }
  Some(Header { locals, params })
}

pub fn read_u8(code: &[u8], ip: usize) -> Option<u8> {
  code.get(ip).copied()
}

pub fn read_u16(code: &[u8], ip: usize) -> Option<u16> {
  let bytes = code.get(ip..ip + 2)?;
  Some(u16::from_le_bytes([bytes[0], bytes[1]]))
}

pub fn read_i16(code: &[u8], ip: usize) -> Option<i16> {
  read_u16(code, ip).map(|v| v as i16)
}

pub fn read_i64(code: &[u8], ip: usize) -> Option<i64> {
  let bytes = code.get(ip..ip + 8)?;
  let mut buf = [0u8; 8];
  buf.copy_from_slice(bytes);
  Some(i64::from_le_bytes(buf))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn dispatch_covers_claimed_bytes() {
    assert_eq!(DISPATCH[b'p' as usize], Op::PushInt);
    assert_eq!(DISPATCH[b'a' as usize], Op::Add);
    assert_eq!(DISPATCH[b'h' as usize], Op::Halt);
    assert_eq!(DISPATCH[b'I' as usize], Op::AssembleName);
    assert_eq!(DISPATCH[0x00], Op::Nop);
  }

  #[test]
  fn unused_bytes_are_undefined() {
    let claimed = b"acdefghjklmnopqrstuvxyzABCFIWX";
    for byte in 1..=255u8 {
      if !claimed.contains(&byte) {
        assert_eq!(DISPATCH[byte as usize], Op::Undefined, "byte {byte:#04x}");
      }
    }
  }

  #[test]
  fn header_validation() {
    assert_eq!(
      header(&[2, 1, b'h']),
      Some(Header {
        locals: 2,
        params: 1
      })
    );
    assert_eq!(header(&[1, 2, b'h']), None);
    assert_eq!(header(&[1]), None);
  }

  #[test]
  fn immediate_readers() {
    let code = [0u8, 0, 0x2a, 0, 0, 0, 0, 0, 0, 0];
    assert_eq!(read_i64(&code, 2), Some(42));
    assert_eq!(read_u16(&code, 2), Some(42));
    assert_eq!(read_i64(&code, 5), None);
    let neg = (-5i16).to_le_bytes();
    assert_eq!(read_i16(&[neg[0], neg[1]], 0), Some(-5));
  }
}
