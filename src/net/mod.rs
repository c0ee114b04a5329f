//! Connection state: a preallocated table of lines, each with its own
//! telnet decoder, input and output buffers, and a status machine the
//! input pump drains one event at a time.

pub mod telnet;

use tokio::net::tcp::OwnedWriteHalf;
use tracing::{debug, info, warn};

use telnet::Telnet;

/// Buffers grow in fixed chunks.
pub const BUF_CHUNK: usize = 16 * 1024;

/// What the input pump reports for one line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LineEvent {
  Connected,
  Disconnected,
  Data(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
  Empty,
  Connecting,
  Idle,
  HasData,
  Disconnecting,
}

pub struct Line {
  pub status: Status,
  pub number: usize,
  pub peer: String,
  telnet: Telnet,
  inbuf: Vec<u8>,
  outbuf: Vec<u8>,
  writer: Option<OwnedWriteHalf>,
}

impl Line {
  fn new(number: usize) -> Line {
    Line {
      status: Status::Empty,
      number,
      peer: String::new(),
      telnet: Telnet::new(),
      inbuf: Vec::new(),
      outbuf: Vec::new(),
      writer: None,
    }
  }

  /// Release buffers and the transport handle; the slot is reusable.
  fn clear(&mut self) {
    self.status = Status::Empty;
    self.peer = String::new();
    self.telnet = Telnet::new();
    self.inbuf = Vec::new();
    self.outbuf = Vec::new();
    self.writer = None;
  }
}

fn append_chunked(buf: &mut Vec<u8>, bytes: &[u8]) {
  let needed = buf.len() + bytes.len();
  if needed > buf.capacity() {
    let shortfall = needed - buf.capacity();
    let chunks = shortfall.div_ceil(BUF_CHUNK);
    let target = buf.capacity() + chunks * BUF_CHUNK;
    buf.reserve_exact(target - buf.len());
  }
  buf.extend_from_slice(bytes);
}

pub struct Lines {
  slots: Vec<Line>,
  cursor: usize,
}

impl Lines {
  pub fn new(maxconns: usize) -> Lines {
    let slots = (0..maxconns).map(Line::new).collect();
    Lines { slots, cursor: 0 }
  }

  pub fn len(&self) -> usize {
    self.slots.len()
  }

  pub fn is_empty(&self) -> bool {
    self.slots.is_empty()
  }

  pub fn get(&self, number: usize) -> Option<&Line> {
    self.slots.get(number)
  }

  pub fn has_free_slot(&self) -> bool {
    self.slots.iter().any(|l| l.status == Status::Empty)
  }

  /// Claim the first empty slot for a new connection. The greeting and
  /// our option offer go straight into the output buffer.
  pub fn attach(&mut self, writer: Option<OwnedWriteHalf>, peer: String) -> Option<usize> {
    let line = self.slots.iter_mut().find(|l| l.status == Status::Empty)?;
    line.status = Status::Connecting;
    line.peer = peer;
    line.telnet = Telnet::new();
    line.inbuf = Vec::with_capacity(BUF_CHUNK);
    line.outbuf = Vec::with_capacity(BUF_CHUNK);
    line.writer = writer;
    let hello = line.telnet.hello();
    append_chunked(&mut line.outbuf, &hello);
    append_chunked(&mut line.outbuf, &telnet::encode("Connected.\n"));
    Some(line.number)
  }

  /// Bytes arrived from the transport: run them through the telnet
  /// decoder, buffer the application data, queue any protocol replies.
  pub fn on_bytes(&mut self, number: usize, bytes: &[u8]) {
    let Some(line) = self.slots.get_mut(number) else {
      return;
    };
    if line.status == Status::Empty || line.status == Status::Disconnecting {
      return;
    }
    let (data, replies) = line.telnet.receive(bytes);
    if !replies.is_empty() {
      append_chunked(&mut line.outbuf, &replies);
    }
    if !data.is_empty() {
      append_chunked(&mut line.inbuf, &data);
      debug!("line {number} input buffer now holds {} bytes", line.inbuf.len());
    }
    if line.status == Status::Idle && line.inbuf.contains(&b'\n') {
      line.status = Status::HasData;
    }
  }

  /// The peer closed or the read side failed.
  pub fn on_closed(&mut self, number: usize) {
    if let Some(line) = self.slots.get_mut(number) {
      if line.status != Status::Empty {
        info!("{} disconnected", line.peer);
        line.status = Status::Disconnecting;
      }
    }
  }

  /// Fair queuing: advance the rotating cursor and report the first
  /// pending event found between it and the end of the table.
  pub fn poll(&mut self) -> Option<(usize, LineEvent)> {
    self.cursor += 1;
    if self.cursor >= self.slots.len() {
      self.cursor = 0;
    }
    while self.cursor < self.slots.len() {
      let number = self.cursor;
      match self.slots[number].status {
        Status::Connecting => {
          let line = &mut self.slots[number];
          line.status = if line.inbuf.contains(&b'\n') {
            Status::HasData
          } else {
            Status::Idle
          };
          return Some((number, LineEvent::Connected));
        }
        Status::Disconnecting => {
          self.slots[number].clear();
          return Some((number, LineEvent::Disconnected));
        }
        Status::HasData => {
          let text = self.take_line_text(number);
          return Some((number, LineEvent::Data(text)));
        }
        _ => self.cursor += 1,
      }
    }
    None
  }

  /// Drain the first complete line from the input buffer, newline
  /// stripped. Drops back to idle when no further newline is pending.
  fn take_line_text(&mut self, number: usize) -> String {
    let line = &mut self.slots[number];
    let mut taken: Vec<u8> = match line.inbuf.iter().position(|&b| b == b'\n') {
      Some(pos) => {
        let mut bytes: Vec<u8> = line.inbuf.drain(..=pos).collect();
        bytes.pop(); // the newline itself
        bytes
      }
      None => std::mem::take(&mut line.inbuf),
    };
    if taken.last() == Some(&b'\r') {
      taken.pop();
    }
    if !line.inbuf.contains(&b'\n') {
      line.status = Status::Idle;
    }
    String::from_utf8_lossy(&taken).into_owned()
  }

  /// Queue encoded text on a line's output buffer.
  pub fn enqueue(&mut self, number: usize, text: &str) {
    let Some(line) = self.slots.get_mut(number) else {
      return;
    };
    if line.status == Status::Empty {
      return;
    }
    let encoded = telnet::encode(text);
    append_chunked(&mut line.outbuf, &encoded);
  }

  /// Push every non-empty output buffer down its transport. Writes
  /// that would block keep their remainder for the next pass.
  pub fn flush_all(&mut self) {
    for line in &mut self.slots {
      if line.status == Status::Empty
        || line.status == Status::Disconnecting
        || line.outbuf.is_empty()
      {
        continue;
      }
      let Some(writer) = &line.writer else {
        continue;
      };
      match writer.try_write(&line.outbuf) {
        Ok(written) => {
          line.outbuf.drain(..written);
        }
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
        Err(e) => {
          warn!("write error on line {}: {e}", line.number);
          line.status = Status::Disconnecting;
        }
      }
    }
  }

  #[cfg(test)]
  fn outbuf(&self, number: usize) -> &[u8] {
    &self.slots[number].outbuf
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn connect(lines: &mut Lines) -> usize {
    lines.attach(None, "test:1".to_string()).unwrap()
  }

  /// One `poll` call only scans from the cursor to the end of the
  /// table; keep calling until the cursor has been everywhere.
  fn next_event(lines: &mut Lines) -> Option<(usize, LineEvent)> {
    for _ in 0..=lines.len() {
      if let Some(ev) = lines.poll() {
        return Some(ev);
      }
    }
    None
  }

  fn drain_connected(lines: &mut Lines, n: usize) {
    assert_eq!(next_event(lines), Some((n, LineEvent::Connected)));
  }

  #[test]
  fn connect_then_idle() {
    let mut lines = Lines::new(4);
    let n = connect(&mut lines);
    assert_eq!(lines.get(n).unwrap().status, Status::Connecting);
    drain_connected(&mut lines, n);
    assert_eq!(lines.get(n).unwrap().status, Status::Idle);
    assert_eq!(next_event(&mut lines), None);
  }

  #[test]
  fn bytes_without_newline_keep_idle() {
    let mut lines = Lines::new(4);
    let n = connect(&mut lines);
    drain_connected(&mut lines, n);
    lines.on_bytes(n, b"look nor");
    assert_eq!(lines.get(n).unwrap().status, Status::Idle);
    lines.on_bytes(n, b"th\r\n");
    assert_eq!(lines.get(n).unwrap().status, Status::HasData);
    assert_eq!(
      next_event(&mut lines),
      Some((n, LineEvent::Data("look north".to_string())))
    );
    assert_eq!(lines.get(n).unwrap().status, Status::Idle);
  }

  #[test]
  fn each_poll_drains_one_line_of_input() {
    let mut lines = Lines::new(4);
    let n = connect(&mut lines);
    drain_connected(&mut lines, n);
    lines.on_bytes(n, b"one\ntwo\n");
    assert_eq!(next_event(&mut lines), Some((n, LineEvent::Data("one".to_string()))));
    assert_eq!(lines.get(n).unwrap().status, Status::HasData);
    assert_eq!(next_event(&mut lines), Some((n, LineEvent::Data("two".to_string()))));
    assert_eq!(lines.get(n).unwrap().status, Status::Idle);
  }

  #[test]
  fn disconnect_frees_the_slot() {
    let mut lines = Lines::new(2);
    let n = connect(&mut lines);
    drain_connected(&mut lines, n);
    lines.on_closed(n);
    assert_eq!(next_event(&mut lines), Some((n, LineEvent::Disconnected)));
    assert_eq!(lines.get(n).unwrap().status, Status::Empty);
    assert!(lines.has_free_slot());
    // slot is reusable
    assert_eq!(lines.attach(None, "again:2".to_string()), Some(n));
  }

  #[test]
  fn table_fills_up() {
    let mut lines = Lines::new(2);
    connect(&mut lines);
    connect(&mut lines);
    assert!(!lines.has_free_slot());
    assert_eq!(lines.attach(None, "late:3".to_string()), None);
  }

  #[test]
  fn cursor_rotates_between_lines() {
    let mut lines = Lines::new(4);
    let a = connect(&mut lines);
    let b = connect(&mut lines);
    let mut connected = vec![
      next_event(&mut lines).unwrap(),
      next_event(&mut lines).unwrap(),
    ];
    connected.sort_by_key(|(n, _)| *n);
    assert_eq!(
      connected,
      vec![(a, LineEvent::Connected), (b, LineEvent::Connected)]
    );
    lines.on_bytes(a, b"from a\n");
    lines.on_bytes(b, b"from b\n");
    let first = next_event(&mut lines).unwrap();
    let second = next_event(&mut lines).unwrap();
    assert_ne!(first.0, second.0);
  }

  #[test]
  fn greeting_is_queued_on_attach() {
    let mut lines = Lines::new(1);
    let n = connect(&mut lines);
    let queued = lines.outbuf(n);
    assert!(queued.windows(10).any(|w| w == b"Connected."));
    assert_eq!(queued[0], 255); // option offer leads
  }

  #[test]
  fn enqueue_encodes_newlines() {
    let mut lines = Lines::new(1);
    let n = connect(&mut lines);
    drain_connected(&mut lines, n);
    let before = lines.outbuf(n).len();
    lines.enqueue(n, "hello\n");
    let queued = &lines.outbuf(n)[before..];
    assert_eq!(queued, b"hello\r\n");
  }
}
