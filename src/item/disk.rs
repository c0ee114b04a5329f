//! Binary round-trip of the itemstore: a depth-first preorder walk of
//! the tree. Fixed-width little-endian records, no magic, no version —
//! any change to the layout is a hard incompatibility.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::rc::Rc;

use tracing::{error, info};

use crate::item::hash::ChildMap;
use crate::item::{Item, ItemId, Payload, Store};
use crate::value::Value;

const NAME_FIELD: usize = 33;

const ITEM_VALUE: u32 = 0;
const ITEM_CODE: u32 = 1;

const VALUE_INT: u32 = 0;
const VALUE_STR: u32 = 1;
const VALUE_NIL: u32 = 2;
const VALUE_BOOL: u32 = 3;

impl Store {
  pub fn save(&self, path: &Path) -> io::Result<()> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    self.write_item(&mut writer, self.root())?;
    writer.flush()?;
    info!("itemstore saved to {}", path.display());
    Ok(())
  }

  fn write_item(&self, w: &mut impl Write, id: ItemId) -> io::Result<()> {
    let item = self.get(id);
    let mut name = [0u8; NAME_FIELD];
    let bytes = item.name.as_bytes();
    let len = bytes.len().min(NAME_FIELD - 1);
    name[..len].copy_from_slice(&bytes[..len]);
    w.write_all(&name)?;
    match &item.payload {
      Payload::Value(value) => {
        w.write_all(&ITEM_VALUE.to_le_bytes())?;
        match value {
          Value::Int(i) => {
            w.write_all(&VALUE_INT.to_le_bytes())?;
            w.write_all(&i.to_le_bytes())?;
          }
          Value::Str(s) => {
            w.write_all(&VALUE_STR.to_le_bytes())?;
            w.write_all(&(s.len() as u32).to_le_bytes())?;
            w.write_all(s.as_bytes())?;
          }
          Value::Nil => {
            w.write_all(&VALUE_NIL.to_le_bytes())?;
            w.write_all(&0i64.to_le_bytes())?;
          }
          Value::Bool(b) => {
            w.write_all(&VALUE_BOOL.to_le_bytes())?;
            w.write_all(&(*b as i64).to_le_bytes())?;
          }
        }
      }
      Payload::Code(code) => {
        w.write_all(&ITEM_CODE.to_le_bytes())?;
        w.write_all(&(code.len() as u32).to_le_bytes())?;
        w.write_all(code)?;
      }
    }
    let children: Vec<ItemId> = item.children.iter().map(|(_, c)| c).collect();
    w.write_all(&(children.len() as u32).to_le_bytes())?;
    for child in children {
      self.write_item(w, child)?;
    }
    Ok(())
  }

  pub fn load(path: &Path) -> io::Result<Store> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut store = Store::empty();
    let root = read_item(&mut reader, None, &mut store)?;
    store.set_root(root);
    info!("itemstore loaded from {}", path.display());
    Ok(store)
  }
}

fn read_u32(r: &mut impl Read) -> io::Result<u32> {
  let mut buf = [0u8; 4];
  r.read_exact(&mut buf)?;
  Ok(u32::from_le_bytes(buf))
}

fn read_i64(r: &mut impl Read) -> io::Result<i64> {
  let mut buf = [0u8; 8];
  r.read_exact(&mut buf)?;
  Ok(i64::from_le_bytes(buf))
}

fn corrupt(what: &str) -> io::Error {
  error!("itemstore is corrupt: {what}");
  io::Error::new(io::ErrorKind::InvalidData, format!("itemstore: {what}"))
}

fn read_item(
  r: &mut impl Read,
  parent: Option<ItemId>,
  store: &mut Store,
) -> io::Result<ItemId> {
  let mut name = [0u8; NAME_FIELD];
  r.read_exact(&mut name)?;
  let end = name.iter().position(|&b| b == 0).unwrap_or(NAME_FIELD - 1);
  let name = std::str::from_utf8(&name[..end])
    .map_err(|_| corrupt("item name is not valid utf-8"))?
    .to_string();

  let item_type = read_u32(r)?;
  let payload = match item_type {
    ITEM_VALUE => {
      let value_type = read_u32(r)?;
      let value = match value_type {
        VALUE_INT => Value::Int(read_i64(r)?),
        VALUE_NIL => {
          read_i64(r)?;
          Value::Nil
        }
        VALUE_BOOL => Value::Bool(read_i64(r)? != 0),
        VALUE_STR => {
          let len = read_u32(r)? as usize;
          let mut bytes = vec![0u8; len];
          r.read_exact(&mut bytes)?;
          Value::Str(
            String::from_utf8(bytes).map_err(|_| corrupt("string payload is not valid utf-8"))?,
          )
        }
        other => return Err(corrupt(&format!("unknown value type {other}"))),
      };
      Payload::Value(value)
    }
    // Code is its own path: the length is validated before the blob is
    // allocated, and a code record never becomes a value item.
    ITEM_CODE => {
      let len = read_u32(r)? as usize;
      let mut bytes = vec![0u8; len];
      r.read_exact(&mut bytes)?;
      Payload::Code(Rc::new(bytes))
    }
    other => return Err(corrupt(&format!("unknown item type {other}"))),
  };

  let num_children = read_u32(r)?;
  let id = match parent {
    Some(parent) => store.make_item(&name, parent, payload),
    None => store.alloc(Item {
      name,
      parent: None,
      children: ChildMap::new(),
      inuse: false,
      payload,
    }),
  };
  for _ in 0..num_children {
    read_item(r, Some(id), store)?;
  }
  Ok(id)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn sample_store() -> Store {
    let mut store = Store::new();
    store.insert_item("foo", Value::Int(7)).unwrap();
    store.insert_item("foo.bar", Value::Str("hello".into())).unwrap();
    store.insert_item("foo.flag", Value::Bool(true)).unwrap();
    store.insert_item("empty", Value::Nil).unwrap();
    store
      .insert_code_item("tick", vec![1, 0, b'p', 1, 0, 0, 0, 0, 0, 0, 0, b'h'])
      .unwrap();
    store
  }

  fn assert_equal_trees(a: &Store, b: &Store, ai: ItemId, bi: ItemId) {
    let left = a.get(ai);
    let right = b.get(bi);
    assert_eq!(left.name, right.name);
    match (&left.payload, &right.payload) {
      (Payload::Value(x), Payload::Value(y)) => assert_eq!(x, y),
      (Payload::Code(x), Payload::Code(y)) => assert_eq!(x, y),
      _ => panic!("item {} changed type across a round trip", left.name),
    }
    let mut lc: Vec<_> = left.children.iter().map(|(k, v)| (k.to_string(), v)).collect();
    let mut rc: Vec<_> = right.children.iter().map(|(k, v)| (k.to_string(), v)).collect();
    lc.sort_by(|a, b| a.0.cmp(&b.0));
    rc.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(lc.len(), rc.len());
    for ((lk, lv), (rk, rv)) in lc.into_iter().zip(rc) {
      assert_eq!(lk, rk);
      assert_equal_trees(a, b, lv, rv);
    }
  }

  #[test]
  fn round_trip_preserves_tree() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("items.dat");
    let store = sample_store();
    store.save(&path).unwrap();
    let loaded = Store::load(&path).unwrap();
    assert_equal_trees(&store, &loaded, store.root(), loaded.root());
  }

  #[test]
  fn save_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let first = dir.path().join("a.dat");
    let second = dir.path().join("b.dat");
    let store = sample_store();
    store.save(&first).unwrap();
    let loaded = Store::load(&first).unwrap();
    loaded.save(&second).unwrap();
    let reloaded = Store::load(&second).unwrap();
    assert_equal_trees(&loaded, &reloaded, loaded.root(), reloaded.root());
  }

  #[test]
  fn loaded_code_item_is_executable_payload() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("items.dat");
    let store = sample_store();
    store.save(&path).unwrap();
    let loaded = Store::load(&path).unwrap();
    let tick = loaded.find("tick").unwrap();
    let code = loaded.get(tick).bytecode().unwrap();
    assert_eq!(code[0], 1);
    assert_eq!(code[code.len() - 1], b'h');
  }

  #[test]
  fn truncated_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("items.dat");
    let store = sample_store();
    store.save(&path).unwrap();
    let bytes = std::fs::read(&path).unwrap();
    std::fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();
    assert!(Store::load(&path).is_err());
  }
}
