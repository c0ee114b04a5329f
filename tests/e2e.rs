use std::time::Duration;

use sinistra::bytecode::builder::Builder;
use sinistra::compile;
use sinistra::libcall::NullHost;
use sinistra::{Config, Interp, Runtime, Store, Value, Vm};

fn test_config(dir: &tempfile::TempDir) -> Config {
  let mut config = Config::default();
  config.itemstore = dir.path().join("items.dat");
  config.srcroot = dir.path().join("srcroot");
  config
}

fn eval(store: &mut Store, config: &Config, code: Vec<u8>) -> Value {
  let mut vm = Vm::new();
  let mut host = NullHost;
  let mut compiler = compile::Unavailable;
  let id = store.insert_code_item("eval", code).unwrap();
  let value = Interp {
    store,
    vm: &mut vm,
    host: &mut host,
    compiler: &mut compiler,
    config,
  }
  .interpret(id)
  .unwrap();
  store.delete("eval");
  value
}

#[test]
fn arithmetic_programs_run_end_to_end() {
  let dir = tempfile::tempdir().unwrap();
  let config = test_config(&dir);
  let mut store = Store::new();
  let code = Builder::new(0, 0).push_int(1).push_int(2).add().halt();
  assert_eq!(eval(&mut store, &config, code), Value::Int(3));
  let code = Builder::new(0, 0).push_str("ab").push_str("cd").add().halt();
  assert_eq!(eval(&mut store, &config, code), Value::Str("abcd".into()));
}

#[test]
fn items_survive_a_persistence_round_trip() {
  let dir = tempfile::tempdir().unwrap();
  let config = test_config(&dir);
  let mut store = Store::new();

  // seed the store through bytecode, then save it
  let code = Builder::new(0, 0)
    .name(&["player", "score"])
    .push_int(9000)
    .assign()
    .halt();
  eval(&mut store, &config, code);
  store
    .insert_code_item("double", Builder::new(1, 1).get_local(0).get_local(0).add().halt())
    .unwrap();
  store.save(&config.itemstore).unwrap();

  // a reloaded store serves both value and code items
  let mut loaded = Store::load(&config.itemstore).unwrap();
  let code = Builder::new(0, 0)
    .name(&["player", "score"])
    .fetch(0)
    .name(&["double"])
    .fetch(1)
    .halt();
  assert_eq!(eval(&mut loaded, &config, code), Value::Int(18000));
}

#[tokio::test(start_paused = true)]
async fn registered_task_fires_once_after_its_start_interval() {
  let local = tokio::task::LocalSet::new();
  local
    .run_until(async {
      let dir = tempfile::tempdir().unwrap();
      let config = test_config(&dir);
      let mut store = Store::new();
      // the task body marks that it ran
      store
        .insert_code_item(
          "tick",
          Builder::new(0, 0).name(&["ticked"]).push_int(1).assign().halt(),
        )
        .unwrap();
      let mut runtime = Runtime::new(config, store, Box::new(compile::Unavailable));

      // boot registers: task.newgametask("tick", 1, 0)
      let boot = Builder::new(0, 0)
        .push_str("tick")
        .push_int(1)
        .push_int(0)
        .libcall(2, 0)
        .halt();
      assert_eq!(runtime.boot(boot), Value::Int(1));

      // the one-shot fires at 100 ms
      assert!(runtime.run_pending_task().await);
      let ticked = runtime.store().find("ticked").unwrap();
      assert_eq!(runtime.store().get(ticked).value(), Some(&Value::Int(1)));

      // no error was recorded
      if let Some(err) = runtime.store().find("sys.error") {
        assert_eq!(runtime.store().get(err).value(), Some(&Value::Int(0)));
      }

      // and it never fires again
      let silence =
        tokio::time::timeout(Duration::from_secs(2), runtime.run_pending_task()).await;
      assert!(silence.is_err());
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn killed_task_never_runs() {
  let local = tokio::task::LocalSet::new();
  local
    .run_until(async {
      let dir = tempfile::tempdir().unwrap();
      let config = test_config(&dir);
      let mut store = Store::new();
      store
        .insert_code_item(
          "tick",
          Builder::new(0, 0).name(&["ticked"]).push_int(1).assign().halt(),
        )
        .unwrap();
      let mut runtime = Runtime::new(config, store, Box::new(compile::Unavailable));

      // register with a long start interval, then kill by id
      let boot = Builder::new(0, 0)
        .push_str("tick")
        .push_int(50)
        .push_int(50)
        .libcall(2, 0)
        .libcall(2, 1)
        .halt();
      assert_eq!(runtime.boot(boot), Value::Bool(true));

      let silence =
        tokio::time::timeout(Duration::from_secs(30), runtime.run_pending_task()).await;
      assert!(silence.is_err());
      assert!(runtime.store().find("ticked").is_none());
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn repeating_task_keeps_running_until_its_guard_stops() {
  let local = tokio::task::LocalSet::new();
  local
    .run_until(async {
      let dir = tempfile::tempdir().unwrap();
      let config = test_config(&dir);
      let mut store = Store::new();
      // bump the counter on every firing while it is below three
      store
        .insert_code_item(
          "counter",
          Builder::new(1, 0)
            .name(&["count"])
            .fetch(0)
            .save_local(0)
            .get_local(0)
            .push_int(3)
            .less()
            .jump_if_false(24) // over the re-assign, straight to halt
            .name(&["count"])
            .get_local(0)
            .push_int(1)
            .add()
            .assign()
            .halt(),
        )
        .unwrap();
      let mut runtime = Runtime::new(config, store, Box::new(compile::Unavailable));
      runtime
        .store_mut()
        .insert_item("count", Value::Int(0))
        .unwrap();

      let boot = Builder::new(0, 0)
        .push_str("counter")
        .push_int(1)
        .push_int(1)
        .libcall(2, 0)
        .halt();
      runtime.boot(boot);

      for _ in 0..5 {
        runtime.run_pending_task().await;
      }
      let count = runtime.store().find("count").unwrap();
      // the counter stops bumping once it reaches three
      assert_eq!(runtime.store().get(count).value(), Some(&Value::Int(3)));
    })
    .await;
}

#[test]
fn boot_item_is_destroyed_after_booting() {
  let dir = tempfile::tempdir().unwrap();
  let config = test_config(&dir);
  let store = Store::new();
  let mut runtime = Runtime::new(config, store, Box::new(compile::Unavailable));
  let boot = Builder::new(0, 0)
    .name(&["booted"])
    .push_int(1)
    .assign()
    .push_int(99)
    .halt();
  assert_eq!(runtime.boot(boot), Value::Int(99));
  // the boot item populated the store but is not itself reachable
  assert!(runtime.store().find("booted").is_some());
  assert!(runtime.store().find("boot").is_none());
}

#[test]
fn recovery_rebuilds_after_a_runaway_program() {
  let dir = tempfile::tempdir().unwrap();
  let config = test_config(&dir);
  let store = Store::new();
  let mut runtime = Runtime::new(config, store, Box::new(compile::Unavailable));
  // an unconditional push loop overflows the operand stack
  let boot = Builder::new(0, 0).push_int(1).jump(-10).halt();
  assert_eq!(runtime.boot(boot), Value::Nil);
  let err = runtime.store().find("sys.error").unwrap();
  assert_eq!(runtime.store().get(err).value(), Some(&Value::Int(20)));
  // the runtime keeps working afterwards
  let boot = Builder::new(0, 0).push_int(5).halt();
  assert_eq!(runtime.boot(boot), Value::Int(5));
}
