//! The host runtime: boots the system, owns the itemstore, the line
//! table, and the scheduler, and drives everything from a single
//! event loop so exactly one logical task runs at any moment.

use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, info, trace};

use crate::compile::Compiler;
use crate::config::Config;
use crate::error::ErrorKind;
use crate::interpret::Interp;
use crate::item::{ItemId, Payload, Store};
use crate::libcall::Host;
use crate::net::{LineEvent, Lines};
use crate::task::Tasks;
use crate::value::Value;
use crate::vm::Vm;

/// How often the input pump runs and output buffers are flushed.
const PUMP_INTERVAL: Duration = Duration::from_millis(10);

pub enum NetEvent {
  Bytes(usize, Vec<u8>),
  Closed(usize),
}

enum LoopEvent {
  Accepted(TcpStream, SocketAddr),
  Net(NetEvent),
  TaskFired(u64),
  Pump,
  Interrupted,
}

pub struct Runtime {
  config: Config,
  store: Store,
  compiler: Box<dyn Compiler>,
  tasks: Tasks,
  lines: Lines,
  input_vm: Vm,
  boot_vm: Vm,
  /// `Some(save)` once shutdown has been requested.
  shutdown: Option<bool>,
  net_tx: UnboundedSender<NetEvent>,
  net_rx: UnboundedReceiver<NetEvent>,
  task_tx: UnboundedSender<u64>,
  task_rx: UnboundedReceiver<u64>,
}

/// The seams libcalls reach through, borrowed disjointly from the
/// runtime so the interpreter can hold the store and a vm at the same
/// time.
struct HostCtx<'a> {
  tasks: &'a mut Tasks,
  lines: &'a mut Lines,
  shutdown: &'a mut Option<bool>,
  task_tx: &'a UnboundedSender<u64>,
}

impl Host for HostCtx<'_> {
  fn spawn_task(&mut self, item: &str, start_ms: u64, repeat_ms: u64) -> u64 {
    self.tasks.spawn(item, start_ms, repeat_ms, self.task_tx.clone())
  }

  fn kill_task(&mut self, id: u64) -> bool {
    self.tasks.kill(id)
  }

  fn poll_input(&mut self) -> Option<(usize, LineEvent)> {
    self.lines.poll()
  }

  fn write_line(&mut self, line: usize, text: &str) {
    self.lines.enqueue(line, text);
  }

  fn max_lines(&self) -> usize {
    self.lines.len()
  }

  fn request_shutdown(&mut self, save: bool) {
    *self.shutdown = Some(save);
  }
}

impl Runtime {
  pub fn new(config: Config, store: Store, compiler: Box<dyn Compiler>) -> Runtime {
    let (net_tx, net_rx) = mpsc::unbounded_channel();
    let (task_tx, task_rx) = mpsc::unbounded_channel();
    let lines = Lines::new(config.maxconns);
    Runtime {
      config,
      store,
      compiler,
      tasks: Tasks::new(),
      lines,
      input_vm: Vm::new(),
      boot_vm: Vm::new(),
      shutdown: None,
      net_tx,
      net_rx,
      task_tx,
      task_rx,
    }
  }

  pub fn store(&self) -> &Store {
    &self.store
  }

  pub fn store_mut(&mut self) -> &mut Store {
    &mut self.store
  }

  pub fn shutdown_requested(&self) -> Option<bool> {
    self.shutdown
  }

  /// Run the bootstrap blob. The boot item sits outside the itemstore
  /// tree and is destroyed again before the event loop runs; it is
  /// expected to populate the store and register tasks, and must not
  /// loop forever.
  pub fn boot(&mut self, bytecode: Vec<u8>) -> Value {
    let boot = self
      .store
      .make_detached("boot", Payload::Code(Rc::new(bytecode)));
    let mut vm = std::mem::take(&mut self.boot_vm);
    let ret = self.run_item(&mut vm, boot);
    self.boot_vm = vm;
    self.store.destroy(boot);
    log_return(&ret);
    ret
  }

  /// One top-level interpreter entry. On the long unwind this is the
  /// safe point: both stacks are rebuilt, stray in-use flags swept,
  /// and the error recorded.
  fn run_item(&mut self, vm: &mut Vm, id: ItemId) -> Value {
    let Runtime {
      config,
      store,
      compiler,
      tasks,
      lines,
      shutdown,
      task_tx,
      ..
    } = self;
    let result = {
      let mut host = HostCtx {
        tasks,
        lines,
        shutdown,
        task_tx,
      };
      let mut interp = Interp {
        store,
        vm,
        host: &mut host,
        compiler: compiler.as_mut(),
        config,
      };
      interp.interpret(id)
    };
    match result {
      Ok(value) => {
        vm.stack.reset();
        value
      }
      Err(unwind) => {
        error!("{unwind}; destroying and recreating all stacks");
        vm.reset();
        store.clear_inuse();
        store.set_error(ErrorKind::RuntimeAbort);
        Value::Nil
      }
    }
  }

  pub async fn run(&mut self) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("::", self.config.port)).await?;
    info!("listening on port {}", self.config.port);
    let mut pump = tokio::time::interval(PUMP_INTERVAL);
    pump.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    info!("running...");
    while self.shutdown.is_none() {
      let event = tokio::select! {
        accepted = listener.accept() => match accepted {
          Ok((stream, peer)) => LoopEvent::Accepted(stream, peer),
          Err(e) => {
            error!("error on new connection: {e}");
            continue;
          }
        },
        Some(ev) = self.net_rx.recv() => LoopEvent::Net(ev),
        Some(id) = self.task_rx.recv() => LoopEvent::TaskFired(id),
        _ = pump.tick() => LoopEvent::Pump,
        _ = tokio::signal::ctrl_c() => LoopEvent::Interrupted,
      };
      match event {
        LoopEvent::Accepted(stream, peer) => self.on_accept(stream, peer),
        LoopEvent::Net(ev) => self.on_net(ev),
        LoopEvent::TaskFired(id) => self.fire_task(id),
        LoopEvent::Pump => self.pump(),
        LoopEvent::Interrupted => {
          info!("interrupt received, shutting down");
          self.shutdown = Some(true);
        }
      }
    }

    info!("shutting down");
    self.tasks.shutdown();
    self.lines.flush_all();
    Ok(())
  }

  /// Wait for the next task firing and run it. For hosts that embed
  /// the runtime without the network loop (and for exercising the
  /// scheduler end to end).
  pub async fn run_pending_task(&mut self) -> bool {
    match self.task_rx.recv().await {
      Some(id) => {
        self.fire_task(id);
        true
      }
      None => false,
    }
  }

  fn on_accept(&mut self, stream: TcpStream, peer: SocketAddr) {
    if !self.lines.has_free_slot() {
      info!("maximum connections ({}) exceeded", self.config.maxconns);
      let _ = stream.try_write(b"Too many connections.\r\n");
      return;
    }
    if let Err(e) = stream.set_nodelay(true) {
      debug!("set_nodelay failed: {e}");
    }
    let (mut reader, writer) = stream.into_split();
    let Some(number) = self.lines.attach(Some(writer), peer.to_string()) else {
      return;
    };
    info!("new connection from {peer}");
    let tx = self.net_tx.clone();
    tokio::task::spawn_local(async move {
      let mut buf = [0u8; 4096];
      loop {
        match reader.read(&mut buf).await {
          Ok(0) => break,
          Ok(n) => {
            if tx.send(NetEvent::Bytes(number, buf[..n].to_vec())).is_err() {
              return;
            }
          }
          Err(e) => {
            debug!("read error on line {number}: {e}");
            break;
          }
        }
      }
      let _ = tx.send(NetEvent::Closed(number));
    });
  }

  fn on_net(&mut self, event: NetEvent) {
    match event {
      NetEvent::Bytes(number, bytes) => self.lines.on_bytes(number, &bytes),
      NetEvent::Closed(number) => self.lines.on_closed(number),
    }
  }

  /// A task timer fired: switch to its virtual machine and run the
  /// named item.
  fn fire_task(&mut self, id: u64) {
    let Some(item_name) = self.tasks.item_name(id).map(str::to_string) else {
      // cancelled between firing and delivery
      return;
    };
    debug!("executing task {item_name} (id: {id})");
    let Some(mut vm) = self.tasks.take_vm(id) else {
      return;
    };
    match self.store.find(&item_name) {
      Some(target) if self.store.get(target).is_code() => {
        let ret = self.run_item(&mut vm, target);
        log_return(&ret);
      }
      _ => error!("cannot execute {item_name}: not a code item"),
    }
    self.tasks.restore_vm(id, vm);
  }

  /// One pump tick: run the input item on its own virtual machine,
  /// then flush every non-empty output buffer.
  fn pump(&mut self) {
    match self.store.find(&self.config.input) {
      Some(input) if self.store.get(input).is_code() => {
        let mut vm = std::mem::take(&mut self.input_vm);
        let _ = self.run_item(&mut vm, input);
        self.input_vm = vm;
      }
      _ => trace!("input item {} is not runnable", self.config.input),
    }
    self.lines.flush_all();
  }
}

fn log_return(value: &Value) {
  match value {
    Value::Nil => info!("bytecode interpreter returned nil"),
    other => info!("bytecode interpreter returned: {other}"),
  }
}
