//! Task management: timer-backed invocations of named items. Each task
//! carries its own virtual machine; the timers live on the event loop
//! and report firings over a channel so the interpreter only ever runs
//! in one place.

use std::time::Duration;

use indexmap::IndexMap;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::info;

use crate::vm::Vm;

/// Monotonic id allocation with a last-in-first-out free list for
/// retired ids.
pub struct TaskIds {
  next: u64,
  retired: Vec<u64>,
}

impl TaskIds {
  pub fn new() -> TaskIds {
    TaskIds {
      next: 1,
      retired: Vec::new(),
    }
  }

  pub fn next_id(&mut self) -> u64 {
    match self.retired.pop() {
      Some(id) => id,
      None => {
        let id = self.next;
        self.next += 1;
        id
      }
    }
  }

  pub fn retire(&mut self, id: u64) {
    if id == self.next - 1 {
      // shortcut
      self.next -= 1;
      return;
    }
    self.retired.push(id);
  }
}

impl Default for TaskIds {
  fn default() -> Self {
    Self::new()
  }
}

pub struct Task {
  pub id: u64,
  pub item: String,
  pub interval_ms: u64,
  vm: Option<Vm>,
  timer: JoinHandle<()>,
}

pub struct Tasks {
  ids: TaskIds,
  tasks: IndexMap<u64, Task>,
}

impl Tasks {
  pub fn new() -> Tasks {
    Tasks {
      ids: TaskIds::new(),
      tasks: IndexMap::new(),
    }
  }

  /// Register a timer: first firing after `start_ms`, then every
  /// `repeat_ms`; zero repeat fires once. Firings are delivered as the
  /// task id on `fired`. Must run inside a `LocalSet`.
  pub fn spawn(
    &mut self,
    item: &str,
    start_ms: u64,
    repeat_ms: u64,
    fired: UnboundedSender<u64>,
  ) -> u64 {
    let id = self.ids.next_id();
    let timer = tokio::task::spawn_local(async move {
      tokio::time::sleep(Duration::from_millis(start_ms)).await;
      if fired.send(id).is_err() {
        return;
      }
      if repeat_ms == 0 {
        return;
      }
      let mut ticker = tokio::time::interval(Duration::from_millis(repeat_ms));
      ticker.tick().await; // the first tick completes immediately
      loop {
        ticker.tick().await;
        if fired.send(id).is_err() {
          return;
        }
      }
    });
    self.tasks.insert(
      id,
      Task {
        id,
        item: item.to_string(),
        interval_ms: repeat_ms,
        vm: Some(Vm::new()),
        timer,
      },
    );
    id
  }

  /// Cancel a task. The timer is closed and the id recycled; a firing
  /// already in flight still runs.
  pub fn kill(&mut self, id: u64) -> bool {
    match self.tasks.shift_remove(&id) {
      Some(task) => {
        info!("destroying task {id} ({})", task.item);
        task.timer.abort();
        self.ids.retire(id);
        true
      }
      None => {
        info!("task id {id} not found, and cannot be deleted");
        false
      }
    }
  }

  pub fn item_name(&self, id: u64) -> Option<&str> {
    self.tasks.get(&id).map(|t| t.item.as_str())
  }

  /// Borrow the task's virtual machine out for an invocation.
  pub fn take_vm(&mut self, id: u64) -> Option<Vm> {
    self.tasks.get_mut(&id).and_then(|t| t.vm.take())
  }

  /// Give the virtual machine back, unless the task killed itself
  /// while it was running.
  pub fn restore_vm(&mut self, id: u64, vm: Vm) {
    if let Some(task) = self.tasks.get_mut(&id) {
      task.vm = Some(vm);
    }
  }

  pub fn len(&self) -> usize {
    self.tasks.len()
  }

  pub fn is_empty(&self) -> bool {
    self.tasks.is_empty()
  }

  /// Walk all timer handles and close them.
  pub fn shutdown(&mut self) {
    for (_, task) in self.tasks.drain(..) {
      task.timer.abort();
    }
  }
}

impl Default for Tasks {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::sync::mpsc;

  #[test]
  fn ids_are_monotonic_with_lifo_reuse() {
    let mut ids = TaskIds::new();
    assert_eq!(ids.next_id(), 1);
    assert_eq!(ids.next_id(), 2);
    assert_eq!(ids.next_id(), 3);
    ids.retire(2);
    ids.retire(1);
    // last retired comes back first
    assert_eq!(ids.next_id(), 1);
    assert_eq!(ids.next_id(), 2);
    assert_eq!(ids.next_id(), 4);
  }

  #[test]
  fn retiring_the_newest_id_rolls_back() {
    let mut ids = TaskIds::new();
    assert_eq!(ids.next_id(), 1);
    assert_eq!(ids.next_id(), 2);
    ids.retire(2);
    assert_eq!(ids.next_id(), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn one_shot_task_fires_exactly_once() {
    let local = tokio::task::LocalSet::new();
    local
      .run_until(async {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut tasks = Tasks::new();
        let id = tasks.spawn("tick", 100, 0, tx);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(rx.try_recv().ok(), Some(id));
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(rx.try_recv().is_err());
      })
      .await;
  }

  #[tokio::test(start_paused = true)]
  async fn repeating_task_fires_until_killed() {
    let local = tokio::task::LocalSet::new();
    local
      .run_until(async {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut tasks = Tasks::new();
        let id = tasks.spawn("tick", 100, 200, tx);
        tokio::time::sleep(Duration::from_millis(550)).await;
        // fired at 100, 300, 500
        let mut count = 0;
        while rx.try_recv().is_ok() {
          count += 1;
        }
        assert_eq!(count, 3);
        assert!(tasks.kill(id));
        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert!(rx.try_recv().is_err());
        assert!(!tasks.kill(id));
      })
      .await;
  }
}
