use std::fmt::Display;

use tracing::warn;

/// A runtime value. Strings own their payload; cloning a value clones
/// the payload, dropping it frees it.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum Value {
  #[default]
  Nil,
  Bool(bool),
  Int(i64),
  Str(String),
}

impl Value {
  pub fn type_name(&self) -> &'static str {
    match self {
      Value::Nil => "nil",
      Value::Bool(_) => "bool",
      Value::Int(_) => "int",
      Value::Str(_) => "str",
    }
  }

  pub fn is_nil(&self) -> bool {
    matches!(self, Value::Nil)
  }

  pub fn as_int(&self) -> Option<i64> {
    match self {
      Value::Int(i) => Some(*i),
      _ => None,
    }
  }

  pub fn as_str(&self) -> Option<&str> {
    match self {
      Value::Str(s) => Some(s.as_str()),
      _ => None,
    }
  }

  /// Coerce to a bool value. Non-zero ints are true, all strings are
  /// true (the payload is consumed), nil is false.
  pub fn to_bool(self) -> bool {
    match self {
      Value::Bool(b) => b,
      Value::Int(i) => i != 0,
      Value::Str(_) => true,
      Value::Nil => false,
    }
  }
}

/// int+int adds (nil counts as 0), str+str concatenates, anything else
/// degrades to nil.
pub fn add(lhs: Value, rhs: Value) -> Value {
  match (lhs, rhs) {
    (Value::Int(a), Value::Int(b)) => Value::Int(a.wrapping_add(b)),
    (Value::Nil, Value::Int(b)) => Value::Int(b),
    (Value::Int(a), Value::Nil) => Value::Int(a),
    (Value::Nil, Value::Nil) => Value::Int(0),
    (Value::Str(mut a), Value::Str(b)) => {
      a.push_str(&b);
      Value::Str(a)
    }
    (lhs, rhs) => {
      warn!(
        "trying to add mismatched types {} and {}, result is nil",
        lhs.type_name(),
        rhs.type_name()
      );
      Value::Nil
    }
  }
}

pub fn subtract(lhs: Value, rhs: Value) -> Value {
  int_binop(lhs, rhs, "subtract", |a, b| a.wrapping_sub(b))
}

pub fn multiply(lhs: Value, rhs: Value) -> Value {
  int_binop(lhs, rhs, "multiply", |a, b| a.wrapping_mul(b))
}

/// Integer division. Division by zero yields 0 with a diagnostic,
/// never a fault.
pub fn divide(lhs: Value, rhs: Value) -> Value {
  match (lhs, rhs) {
    (Value::Int(_), Value::Int(0)) => {
      warn!("attempt to divide by zero, substituting zero as result");
      Value::Int(0)
    }
    (Value::Int(a), Value::Int(b)) => Value::Int(a.wrapping_div(b)),
    (lhs, rhs) => {
      warn!(
        "trying to divide types {} and {}, result is nil",
        lhs.type_name(),
        rhs.type_name()
      );
      Value::Nil
    }
  }
}

fn int_binop(lhs: Value, rhs: Value, what: &str, f: impl Fn(i64, i64) -> i64) -> Value {
  match (lhs, rhs) {
    (Value::Int(a), Value::Int(b)) => Value::Int(f(a, b)),
    (lhs, rhs) => {
      warn!(
        "trying to {what} types {} and {}, result is nil",
        lhs.type_name(),
        rhs.type_name()
      );
      Value::Nil
    }
  }
}

/// Same-type int/bool/str pairs compare by payload; every cross-type
/// pair is unequal, including nil against nil.
pub fn equal(lhs: &Value, rhs: &Value) -> bool {
  match (lhs, rhs) {
    (Value::Int(a), Value::Int(b)) => a == b,
    (Value::Bool(a), Value::Bool(b)) => a == b,
    (Value::Str(a), Value::Str(b)) => a == b,
    _ => false,
  }
}

/// Ordering is defined between int/int and bool/bool only.
pub fn ordered(lhs: &Value, rhs: &Value) -> Option<std::cmp::Ordering> {
  match (lhs, rhs) {
    (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
    (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
    _ => None,
  }
}

impl Display for Value {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Value::Nil => write!(f, "nil"),
      Value::Bool(b) => write!(f, "{}", if *b { "true" } else { "false" }),
      Value::Int(i) => write!(f, "{i}"),
      Value::Str(s) => write!(f, "{s}"),
    }
  }
}

impl From<i64> for Value {
  fn from(value: i64) -> Self {
    Value::Int(value)
  }
}

impl From<bool> for Value {
  fn from(value: bool) -> Self {
    Value::Bool(value)
  }
}

impl From<&str> for Value {
  fn from(value: &str) -> Self {
    Value::Str(value.to_string())
  }
}

impl From<String> for Value {
  fn from(value: String) -> Self {
    Value::Str(value)
  }
}

#[cfg(test)]
mod tests {
  use std::cmp::Ordering;

  use super::*;

  #[test]
  fn add_ints_and_nil() {
    assert_eq!(add(Value::Int(1), Value::Int(2)), Value::Int(3));
    assert_eq!(add(Value::Nil, Value::Int(5)), Value::Int(5));
    assert_eq!(add(Value::Int(5), Value::Nil), Value::Int(5));
    assert_eq!(add(Value::Nil, Value::Nil), Value::Int(0));
  }

  #[test]
  fn add_strings_concatenates() {
    assert_eq!(
      add(Value::from("ab"), Value::from("cd")),
      Value::from("abcd")
    );
  }

  #[test]
  fn add_mismatched_is_nil() {
    assert_eq!(add(Value::Int(1), Value::from("x")), Value::Nil);
    assert_eq!(add(Value::Bool(true), Value::Int(1)), Value::Nil);
  }

  #[test]
  fn int_only_arithmetic() {
    assert_eq!(subtract(Value::Int(5), Value::Int(3)), Value::Int(2));
    assert_eq!(multiply(Value::Int(6), Value::Int(7)), Value::Int(42));
    assert_eq!(divide(Value::Int(10), Value::Int(2)), Value::Int(5));
    assert_eq!(subtract(Value::Nil, Value::Int(3)), Value::Nil);
    assert_eq!(multiply(Value::from("a"), Value::Int(3)), Value::Nil);
  }

  #[test]
  fn divide_by_zero_is_zero() {
    assert_eq!(divide(Value::Int(10), Value::Int(0)), Value::Int(0));
  }

  #[test]
  fn wrapping_overflow() {
    assert_eq!(
      add(Value::Int(i64::MAX), Value::Int(1)),
      Value::Int(i64::MIN)
    );
  }

  #[test]
  fn equality_is_same_type_only() {
    assert!(equal(&Value::Int(1), &Value::Int(1)));
    assert!(equal(&Value::from("a"), &Value::from("a")));
    assert!(equal(&Value::Bool(true), &Value::Bool(true)));
    assert!(!equal(&Value::Int(1), &Value::Bool(true)));
    assert!(!equal(&Value::Int(0), &Value::Nil));
    // nil never matches, not even itself
    assert!(!equal(&Value::Nil, &Value::Nil));
  }

  #[test]
  fn ordering_int_and_bool_only() {
    assert_eq!(ordered(&Value::Int(1), &Value::Int(2)), Some(Ordering::Less));
    assert_eq!(
      ordered(&Value::Bool(false), &Value::Bool(true)),
      Some(Ordering::Less)
    );
    assert_eq!(ordered(&Value::Int(1), &Value::Bool(true)), None);
    assert_eq!(ordered(&Value::from("a"), &Value::from("b")), None);
  }

  #[test]
  fn bool_coercion() {
    assert!(!Value::Nil.to_bool());
    assert!(!Value::Int(0).to_bool());
    assert!(Value::Int(-3).to_bool());
    assert!(Value::from("").to_bool());
    assert!(!Value::Bool(false).to_bool());
  }
}
