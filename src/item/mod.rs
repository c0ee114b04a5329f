//! The item is the basic unit of storage. It may contain a value or
//! bytecode, and it may contain nested items. Items live in an arena
//! and refer to each other by id, so the parent/child cycle needs no
//! back-pointers.

pub mod disk;
pub mod hash;
pub mod source;

use std::rc::Rc;

use tracing::{debug, error, info};

use crate::error::ErrorKind;
use crate::value::Value;

use hash::ChildMap;

/// Items are up to 8 layers deep, each layer name at most 32
/// characters, with a dot between layers.
pub const MAX_LAYERS: usize = 8;
pub const MAX_LAYER_LEN: usize = 32;
pub const MAX_ITEM_NAME: usize = MAX_LAYERS * MAX_LAYER_LEN + (MAX_LAYERS - 1);

/// Handle into the item arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ItemId(u32);

impl ItemId {
  pub const ROOT: ItemId = ItemId(0);

  pub fn from_index(index: usize) -> ItemId {
    ItemId(index as u32)
  }

  pub fn index(self) -> usize {
    self.0 as usize
  }
}

#[derive(Clone, Debug)]
pub enum Payload {
  Value(Value),
  /// Bytecode is shared so an invocation keeps the blob it started
  /// with alive; the `inuse` flag refuses replacement anyway.
  Code(Rc<Vec<u8>>),
}

#[derive(Debug)]
pub struct Item {
  pub name: String,
  pub parent: Option<ItemId>,
  pub children: ChildMap,
  /// Set while the item is executing; forbids replacement and
  /// deletion for as long as it is on the call chain.
  pub inuse: bool,
  pub payload: Payload,
}

impl Item {
  pub fn is_code(&self) -> bool {
    matches!(self.payload, Payload::Code(_))
  }

  pub fn value(&self) -> Option<&Value> {
    match &self.payload {
      Payload::Value(v) => Some(v),
      Payload::Code(_) => None,
    }
  }

  pub fn bytecode(&self) -> Option<Rc<Vec<u8>>> {
    match &self.payload {
      Payload::Code(code) => Some(code.clone()),
      Payload::Value(_) => None,
    }
  }
}

/// Layer names may be no longer than 32 characters and consist only of
/// characters in the set `[A-Za-z0-9_]`.
pub fn is_valid_layer(layer: &str) -> bool {
  if layer.is_empty() || layer.len() > MAX_LAYER_LEN {
    return false;
  }
  layer
    .bytes()
    .all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

fn split_layers(name: &str) -> Option<Vec<&str>> {
  let layers: Vec<&str> = name.split('.').collect();
  if layers.len() > MAX_LAYERS {
    error!("item name {name} exceeds {MAX_LAYERS} layers");
    return None;
  }
  for layer in &layers {
    if layer.is_empty() || layer.len() > MAX_LAYER_LEN {
      error!("invalid layer in item name {name}");
      return None;
    }
  }
  Some(layers)
}

/// The itemstore: a tree of items anchored at a nameless-for-lookup
/// root. Freed slots are recycled through a free list.
pub struct Store {
  items: Vec<Option<Item>>,
  free: Vec<ItemId>,
  root: ItemId,
}

impl Store {
  pub fn new() -> Store {
    let mut store = Store {
      items: Vec::new(),
      free: Vec::new(),
      root: ItemId::ROOT,
    };
    store.root = store.alloc(Item {
      name: "root".to_string(),
      parent: None,
      children: ChildMap::new(),
      inuse: false,
      payload: Payload::Value(Value::Int(0)),
    });
    store
  }

  pub(crate) fn empty() -> Store {
    Store {
      items: Vec::new(),
      free: Vec::new(),
      root: ItemId::ROOT,
    }
  }

  pub fn root(&self) -> ItemId {
    self.root
  }

  pub(crate) fn set_root(&mut self, id: ItemId) {
    self.root = id;
  }

  pub fn get(&self, id: ItemId) -> &Item {
    self.items[id.index()]
      .as_ref()
      .expect("item id points at a freed slot")
  }

  pub fn get_mut(&mut self, id: ItemId) -> &mut Item {
    self.items[id.index()]
      .as_mut()
      .expect("item id points at a freed slot")
  }

  pub(crate) fn alloc(&mut self, item: Item) -> ItemId {
    match self.free.pop() {
      Some(id) => {
        self.items[id.index()] = Some(item);
        id
      }
      None => {
        let id = ItemId::from_index(self.items.len());
        self.items.push(Some(item));
        id
      }
    }
  }

  /// Create a child under `parent`. Does not check whether the layer
  /// already exists: callers must do that first.
  pub fn make_item(&mut self, name: &str, parent: ItemId, payload: Payload) -> ItemId {
    let id = self.alloc(Item {
      name: name.to_string(),
      parent: Some(parent),
      children: ChildMap::new(),
      inuse: false,
      payload,
    });
    self.get_mut(parent).children.insert(name, id);
    id
  }

  /// Create an item with no parent, outside the tree. Used for the
  /// bootstrap item, which must never be reachable by name.
  pub fn make_detached(&mut self, name: &str, payload: Payload) -> ItemId {
    self.alloc(Item {
      name: name.to_string(),
      parent: None,
      children: ChildMap::new(),
      inuse: false,
      payload,
    })
  }

  /// Walk a dotted name from the root, creating missing intermediate
  /// layers as nil value items.
  fn walk_creating(&mut self, name: &str) -> Option<ItemId> {
    let layers = split_layers(name)?;
    let mut current = self.root;
    for layer in layers {
      current = match self.get(current).children.get(layer) {
        Some(child) => child,
        None => self.make_item(layer, current, Payload::Value(Value::Nil)),
      };
    }
    Some(current)
  }

  /// Insert (or overwrite) a value item by dotted name. Fails if the
  /// target is a code item currently executing.
  pub fn insert_item(&mut self, name: &str, value: Value) -> Option<ItemId> {
    debug!("creating item {name}");
    let id = self.walk_creating(name)?;
    let item = self.get_mut(id);
    if item.is_code() && item.inuse {
      error!("cannot replace item {name}: currently in use");
      return None;
    }
    item.payload = Payload::Value(value);
    Some(id)
  }

  /// Insert (or overwrite) a code item by dotted name. Fails if the
  /// target is a code item currently executing.
  pub fn insert_code_item(&mut self, name: &str, bytecode: Vec<u8>) -> Option<ItemId> {
    debug!("creating code item {name}");
    let id = self.walk_creating(name)?;
    let item = self.get_mut(id);
    if item.is_code() && item.inuse {
      error!("cannot replace code item {name}: currently in use");
      return None;
    }
    item.payload = Payload::Code(Rc::new(bytecode));
    Some(id)
  }

  pub fn find(&self, name: &str) -> Option<ItemId> {
    let mut current = self.root;
    for layer in name.split('.') {
      current = self.get(current).children.get(layer)?;
    }
    Some(current)
  }

  /// Find an item and set its value, creating it if absent.
  pub fn set_item(&mut self, name: &str, value: Value) {
    debug!("setting item {name}");
    self.insert_item(name, value);
  }

  /// Delete an item and all of its children. Deleting an item that is
  /// in use is refused; deleting one that does not exist is ignored.
  pub fn delete(&mut self, name: &str) -> bool {
    let Some(id) = self.find(name) else {
      return false;
    };
    if self.get(id).inuse {
      error!("cannot delete item {}: currently in use", self.full_name(id));
      return false;
    }
    if let Some(parent) = self.get(id).parent {
      let layer = self.get(id).name.clone();
      self.get_mut(parent).children.remove(&layer);
    }
    self.destroy(id);
    debug!("item {name} has been deleted, along with all of its children");
    true
  }

  /// Free an item and its whole subtree. The parent's children map is
  /// not touched: unlink first.
  pub fn destroy(&mut self, id: ItemId) {
    let children: Vec<ItemId> = self.get(id).children.iter().map(|(_, c)| c).collect();
    for child in children {
      self.destroy(child);
    }
    self.items[id.index()] = None;
    self.free.push(id);
  }

  /// The fully-qualified name: ancestor layers from just below the
  /// root down to the item, dot-joined.
  pub fn full_name(&self, id: ItemId) -> String {
    let mut layers = Vec::new();
    let mut current = Some(id);
    while let Some(cid) = current {
      let item = self.get(cid);
      if item.parent.is_none() {
        break;
      }
      layers.push(item.name.as_str());
      current = item.parent;
    }
    layers.reverse();
    layers.join(".")
  }

  /// Record an error kind in `sys.error`, and its message in
  /// `sys.error.msg`. Both cells are created on first failure.
  pub fn set_error(&mut self, kind: ErrorKind) {
    self.set_item("sys.error", Value::Int(kind.code()));
    self.set_item("sys.error.msg", Value::Str(kind.message().to_string()));
  }

  /// Clear every `inuse` flag. Used by safe-point recovery after the
  /// long unwind, when normal interpreter exits were skipped.
  pub fn clear_inuse(&mut self) {
    for slot in self.items.iter_mut().flatten() {
      slot.inuse = false;
    }
  }

  /// Log the whole tree, one line per item.
  pub fn dump(&self) {
    self.dump_from(self.root, "");
  }

  fn dump_from(&self, id: ItemId, prefix: &str) {
    let item = self.get(id);
    let path = if item.parent.is_none() {
      String::new()
    } else if prefix.is_empty() {
      item.name.clone()
    } else {
      format!("{prefix}.{}", item.name)
    };
    if item.parent.is_some() {
      match &item.payload {
        Payload::Value(v) => info!("item: {path}, value: {v}"),
        Payload::Code(code) => info!("item: {path}, code: {} bytes", code.len()),
      }
    }
    for (_, child) in self.get(id).children.iter() {
      self.dump_from(child, &path);
    }
  }

  /// Number of live items, the root included.
  pub fn len(&self) -> usize {
    self.items.iter().filter(|i| i.is_some()).count()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

impl Default for Store {
  fn default() -> Self {
    Self::new()
  }
}
