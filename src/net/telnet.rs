//! A minimal telnet NVT codec: splits application data from option
//! negotiation, escapes IAC on the way out, and normalizes line
//! endings. Policy: offer ECHO to the peer, refuse everything the peer
//! offers (ECHO included), refuse every other request.

const IAC: u8 = 255;
const DONT: u8 = 254;
const DO: u8 = 253;
const WONT: u8 = 252;
const WILL: u8 = 251;
const SB: u8 = 250;
const SE: u8 = 240;

pub const OPT_ECHO: u8 = 1;

enum State {
  Data,
  Cr,
  Iac,
  Command(u8),
  Subneg,
  SubnegIac,
}

pub struct Telnet {
  state: State,
}

impl Telnet {
  pub fn new() -> Telnet {
    Telnet { state: State::Data }
  }

  /// The negotiation sent once at connect: offer ECHO to the peer.
  pub fn hello(&self) -> Vec<u8> {
    vec![IAC, WILL, OPT_ECHO]
  }

  /// Feed received bytes through the decoder. Returns the application
  /// data and any protocol replies to send back.
  pub fn receive(&mut self, bytes: &[u8]) -> (Vec<u8>, Vec<u8>) {
    let mut data = Vec::with_capacity(bytes.len());
    let mut replies = Vec::new();
    for &b in bytes {
      match self.state {
        State::Data => match b {
          IAC => self.state = State::Iac,
          b'\r' => self.state = State::Cr,
          _ => data.push(b),
        },
        // CR LF is a newline, CR NUL a bare CR; anything else follows
        // a stray CR and is processed normally.
        State::Cr => {
          self.state = State::Data;
          match b {
            b'\n' => data.push(b'\n'),
            0 => data.push(b'\r'),
            IAC => {
              data.push(b'\n');
              self.state = State::Iac;
            }
            _ => {
              data.push(b'\n');
              data.push(b);
            }
          }
        }
        State::Iac => match b {
          IAC => {
            data.push(IAC);
            self.state = State::Data;
          }
          WILL | WONT | DO | DONT => self.state = State::Command(b),
          SB => self.state = State::Subneg,
          // NOP, GA and friends carry no operand
          _ => self.state = State::Data,
        },
        State::Command(cmd) => {
          if let Some(reply) = negotiate(cmd, b) {
            replies.extend_from_slice(&reply);
          }
          self.state = State::Data;
        }
        State::Subneg => {
          if b == IAC {
            self.state = State::SubnegIac;
          }
        }
        State::SubnegIac => {
          self.state = if b == SE { State::Data } else { State::Subneg };
        }
      }
    }
    (data, replies)
  }
}

impl Default for Telnet {
  fn default() -> Self {
    Self::new()
  }
}

fn negotiate(cmd: u8, opt: u8) -> Option<[u8; 3]> {
  match (cmd, opt) {
    // we offered ECHO ourselves; agreement needs no answer
    (DO, OPT_ECHO) => None,
    (DO, _) => Some([IAC, WONT, opt]),
    // refuse whatever the peer offers
    (WILL, _) => Some([IAC, DONT, opt]),
    _ => None,
  }
}

/// Encode outgoing text: IAC doubled, newlines as CR LF.
pub fn encode(text: &str) -> Vec<u8> {
  let mut out = Vec::with_capacity(text.len() + 2);
  for &b in text.as_bytes() {
    match b {
      b'\n' => out.extend_from_slice(b"\r\n"),
      IAC => out.extend_from_slice(&[IAC, IAC]),
      _ => out.push(b),
    }
  }
  out
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn plain_data_passes_through() {
    let mut t = Telnet::new();
    let (data, replies) = t.receive(b"look north\n");
    assert_eq!(data, b"look north\n");
    assert!(replies.is_empty());
  }

  #[test]
  fn crlf_collapses_to_newline() {
    let mut t = Telnet::new();
    let (data, _) = t.receive(b"hello\r\nthere\r\n");
    assert_eq!(data, b"hello\nthere\n");
  }

  #[test]
  fn escaped_iac_is_literal() {
    let mut t = Telnet::new();
    let (data, _) = t.receive(&[b'a', IAC, IAC, b'b']);
    assert_eq!(data, vec![b'a', IAC, b'b']);
  }

  #[test]
  fn peer_echo_offer_is_refused() {
    let mut t = Telnet::new();
    let (data, replies) = t.receive(&[IAC, WILL, OPT_ECHO]);
    assert!(data.is_empty());
    assert_eq!(replies, vec![IAC, DONT, OPT_ECHO]);
  }

  #[test]
  fn unknown_do_is_refused() {
    let mut t = Telnet::new();
    let (_, replies) = t.receive(&[IAC, DO, 31]);
    assert_eq!(replies, vec![IAC, WONT, 31]);
  }

  #[test]
  fn our_echo_offer_is_acknowledged_silently() {
    let mut t = Telnet::new();
    let (_, replies) = t.receive(&[IAC, DO, OPT_ECHO]);
    assert!(replies.is_empty());
  }

  #[test]
  fn subnegotiation_is_skipped() {
    let mut t = Telnet::new();
    let (data, _) = t.receive(&[IAC, SB, 24, 1, 2, 3, IAC, SE, b'x']);
    assert_eq!(data, b"x");
  }

  #[test]
  fn negotiation_split_across_reads() {
    let mut t = Telnet::new();
    let (_, replies) = t.receive(&[IAC]);
    assert!(replies.is_empty());
    let (_, replies) = t.receive(&[WILL]);
    assert!(replies.is_empty());
    let (_, replies) = t.receive(&[OPT_ECHO]);
    assert_eq!(replies, vec![IAC, DONT, OPT_ECHO]);
  }

  #[test]
  fn encode_expands_newlines_and_iac() {
    assert_eq!(encode("hi\n"), b"hi\r\n");
    assert_eq!(encode("a\u{00ff}b").len(), 4); // ÿ is two utf-8 bytes, no IAC
    let raw = String::from_utf8(vec![b'x']).unwrap();
    assert_eq!(encode(&raw), b"x");
  }
}
