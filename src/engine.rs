//! The state machine that owns the transport: sequences tags, awaits
//! server continuation requests, and interleaves asynchronous untagged
//! responses with command completion.
//!
//! Grounded on `_loop` / `_loop_from_server` in
//! `python/ymaplib/IMAPParser.py`, re-expressed per the "state machine vs
//! coroutine flows" design note: STARTTLS/AUTHENTICATE/IDLE are explicit
//! sub-states here, and a continuation request is an ordinary event
//! (`ParsedLine::Continuation`), never an exception.

use std::collections::HashSet;
use std::time::Duration;

use base64::Engine as _;

use crate::{
  command::{self, Command, Encode, Mechanism},
  error::{summarize, Error},
  response::{self, CodePayload, Data, Kind, ParsedLine, Response, Tag},
  transport::Transport,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
  Unknown,
  Healthy,
  Broken,
}

/// A command awaiting dispatch, paired with its allocated tag and — for
/// `AUTHENTICATE` — the SASL mechanism driving the challenge/response
/// exchange.
pub struct Pending {
  pub tag: String,
  pub command: Command,
  pub mechanism: Option<Box<dyn Mechanism + Send>>,
}

pub struct Engine {
  capabilities: HashSet<Vec<u8>>,
  capabilities_mask: HashSet<Vec<u8>>,
  literal_plus: bool,
  in_idle: bool,
  idle_tag: Option<String>,
  health: Health,
}

fn upper_set(atoms: &[Vec<u8>]) -> HashSet<Vec<u8>> {
  atoms.iter().map(|a| a.to_ascii_uppercase()).collect()
}

impl Engine {
  pub fn new(capabilities_mask: HashSet<Vec<u8>>) -> Self {
    Self {
      capabilities: HashSet::new(),
      capabilities_mask,
      literal_plus: false,
      in_idle: false,
      idle_tag: None,
      health: Health::Unknown,
    }
  }

  pub fn health(&self) -> Health {
    self.health
  }

  pub fn capabilities(&self) -> &HashSet<Vec<u8>> {
    &self.capabilities
  }

  pub fn literal_plus(&self) -> bool {
    self.literal_plus
  }

  fn set_capabilities(&mut self, observed: &[Vec<u8>]) {
    let observed = upper_set(observed);
    self.capabilities = observed
      .difference(&self.capabilities_mask)
      .cloned()
      .collect();
    self.literal_plus = self.capabilities.contains(b"LITERAL+".as_slice());
  }

  fn note_response(&mut self, response: &Response) {
    if self.health == Health::Unknown {
      self.health = Health::Healthy;
    }
    if response.kind == Kind::Bye {
      self.health = Health::Broken;
    }
    if let Data::Capability(atoms) = &response.data {
      self.set_capabilities(atoms);
    }
    if let Some(code) = &response.response_code {
      if code.name == b"CAPABILITY" {
        if let CodePayload::Atoms(atoms) = &code.payload {
          self.set_capabilities(atoms);
        }
      }
    }
  }

  fn read_one<T: Transport>(&mut self, transport: &mut T) -> Result<ParsedLine, Error> {
    let line = transport.read_line().map_err(Error::Transport)?;
    log::debug!("< {}", summarize(&line));
    response::parse_line(line, transport)
  }

  /// One iteration of the engine loop (§4.5). `dequeue` is called at most
  /// once, and only when a command should be considered for dispatch;
  /// `publish` is called once per response parsed, in parse order.
  pub fn step<T, D, P>(
    &mut self,
    transport: &mut T,
    poll_timeout: Duration,
    dequeue: D,
    mut publish: P,
  ) -> Result<(), Error>
  where
    T: Transport,
    D: FnOnce() -> Option<Pending>,
    P: FnMut(Response),
  {
    if self.health != Health::Broken {
      match transport.wait_readable(Some(poll_timeout)) {
        Ok(true) => match self.read_one(transport) {
          Ok(ParsedLine::Response(response)) => {
            self.note_response(&response);
            publish(response);
          }
          Ok(ParsedLine::Continuation(_)) => {
            // A continuation arriving outside a special flow is a fault
            // the caller surfaces, per §4.2/§7: it is never silently
            // dropped.
            self.health = Health::Broken;
            return Err(Error::InvalidResponse(
              "unexpected continuation request outside a special flow".into(),
            ));
          }
          Err(error) => {
            self.health = Health::Broken;
            return Err(error);
          }
        },
        Ok(false) => (),
        Err(error) => {
          self.health = Health::Broken;
          return Err(Error::Transport(error));
        }
      }
    }
    if !transport.healthy() {
      self.health = Health::Broken;
    }
    if self.health == Health::Broken {
      return Ok(());
    }

    let Some(pending) = dequeue() else {
      return Ok(());
    };

    if self.in_idle {
      if let Err(error) = transport.write(b"DONE\r\n").and_then(|_| transport.flush()) {
        self.health = Health::Broken;
        return Err(Error::Transport(error));
      }
      self.in_idle = false;
      if let Some(idle_tag) = self.idle_tag.take() {
        self.drain_until_tagged(transport, &idle_tag, &mut publish)?;
      }
    }

    self.dispatch(transport, pending, &mut publish)
  }

  /// Reads and publishes responses until the tagged completion for `tag`
  /// is seen. Poisons the engine on any fault, per §3: a transport error
  /// or parse fault is fatal regardless of where in the loop it surfaces.
  fn drain_until_tagged<T: Transport>(
    &mut self,
    transport: &mut T,
    tag: &str,
    publish: &mut impl FnMut(Response),
  ) -> Result<Response, Error> {
    loop {
      let parsed = match self.read_one(transport) {
        Ok(parsed) => parsed,
        Err(error) => {
          self.health = Health::Broken;
          return Err(error);
        }
      };
      match parsed {
        ParsedLine::Response(response) => {
          self.note_response(&response);
          let is_final = response.tag == Tag::Tagged(tag.to_string());
          publish(response.clone());
          if is_final {
            return Ok(response);
          }
        }
        ParsedLine::Continuation(_) => {
          self.health = Health::Broken;
          return Err(Error::InvalidResponse(
            "unexpected continuation request while draining a command".into(),
          ));
        }
      }
    }
  }

  /// Poisons the engine on any sub-dispatch fault, as a backstop on top of
  /// each sub-dispatcher's own poisoning: every error this returns, from
  /// whichever branch, leaves `health() == Broken` before the caller sees
  /// it, per §3's "any parse fault" (broken is never scoped to only the
  /// fault kinds each sub-flow happens to check for itself).
  fn dispatch<T: Transport>(
    &mut self,
    transport: &mut T,
    mut pending: Pending,
    publish: &mut impl FnMut(Response),
  ) -> Result<(), Error> {
    let first = pending
      .command
      .name
      .to_ascii_uppercase();
    let result = match first.as_slice() {
      b"IDLE" => self.dispatch_idle(transport, &pending.tag, publish),
      b"STARTTLS" => self.dispatch_starttls(transport, &pending.tag, publish),
      b"AUTHENTICATE" => match pending.mechanism.take() {
        Some(mechanism) => self.dispatch_authenticate(transport, &pending.tag, mechanism, publish),
        None => Err(Error::InvalidResponse("AUTHENTICATE without a mechanism".into())),
      },
      _ => self.dispatch_generic(transport, &pending.tag, &pending.command, publish),
    };
    if result.is_err() {
      self.health = Health::Broken;
    }
    result
  }

  fn dispatch_idle<T: Transport>(
    &mut self,
    transport: &mut T,
    tag: &str,
    publish: &mut impl FnMut(Response),
  ) -> Result<(), Error> {
    let line = format!("{tag} IDLE\r\n");
    log::debug!("> {}", summarize(line.as_bytes()));
    if let Err(error) = transport.write(line.as_bytes()).and_then(|_| transport.flush()) {
      self.health = Health::Broken;
      return Err(Error::Transport(error));
    }
    loop {
      let parsed = match self.read_one(transport) {
        Ok(parsed) => parsed,
        Err(error) => {
          self.health = Health::Broken;
          return Err(error);
        }
      };
      match parsed {
        ParsedLine::Continuation(_) => {
          self.in_idle = true;
          self.idle_tag = Some(tag.to_string());
          return Ok(());
        }
        ParsedLine::Response(response) => {
          self.note_response(&response);
          let is_final = response.tag == Tag::Tagged(tag.to_string());
          publish(response);
          if is_final {
            // IDLE refused by the server before a continuation arrived.
            return Ok(());
          }
        }
      }
    }
  }

  fn dispatch_starttls<T: Transport>(
    &mut self,
    transport: &mut T,
    tag: &str,
    publish: &mut impl FnMut(Response),
  ) -> Result<(), Error> {
    let line = format!("{tag} STARTTLS\r\n");
    log::debug!("> {}", summarize(line.as_bytes()));
    if let Err(error) = transport.write(line.as_bytes()).and_then(|_| transport.flush()) {
      self.health = Health::Broken;
      return Err(Error::Transport(error));
    }
    let completion = self.drain_until_tagged(transport, tag, publish)?;
    if completion.kind == Kind::Ok {
      transport.upgrade_tls();
    }
    Ok(())
  }

  fn dispatch_authenticate<T: Transport>(
    &mut self,
    transport: &mut T,
    tag: &str,
    mut mechanism: Box<dyn Mechanism + Send>,
    publish: &mut impl FnMut(Response),
  ) -> Result<(), Error> {
    let line = format!("{tag} AUTHENTICATE {}\r\n", mechanism.name());
    log::debug!("> {}", summarize(line.as_bytes()));
    if let Err(error) = transport.write(line.as_bytes()).and_then(|_| transport.flush()) {
      self.health = Health::Broken;
      return Err(Error::Transport(error));
    }
    let base64 = base64::engine::GeneralPurpose::new(
      &base64::alphabet::STANDARD,
      base64::engine::general_purpose::PAD,
    );
    loop {
      let parsed = match self.read_one(transport) {
        Ok(parsed) => parsed,
        Err(error) => {
          self.health = Health::Broken;
          return Err(error);
        }
      };
      match parsed {
        ParsedLine::Continuation(payload) => {
          let challenge = base64.decode(&payload).unwrap_or_default();
          let reply = match mechanism.chat(&challenge) {
            Some(reply) => base64.encode(reply).into_bytes(),
            None => b"*".to_vec(),
          };
          // Unlike every other outgoing line, the SASL reply itself is
          // never logged (only its length), mirroring `stream.input`'s
          // `log: command.len()` in `sync/mod.rs::authenticate`, which
          // logs the `AUTHENTICATE PLAIN ` prefix but never the encoded
          // credentials that follow it.
          log::debug!("> ...{} bytes omitted...", reply.len());
          let sent = transport
            .write(&reply)
            .and_then(|_| transport.write(b"\r\n"))
            .and_then(|_| transport.flush());
          if let Err(error) = sent {
            self.health = Health::Broken;
            return Err(Error::Transport(error));
          }
        }
        ParsedLine::Response(response) => {
          self.note_response(&response);
          let is_final = response.tag == Tag::Tagged(tag.to_string());
          publish(response);
          if is_final {
            return Ok(());
          }
        }
      }
    }
  }

  fn dispatch_generic<T: Transport>(
    &mut self,
    transport: &mut T,
    tag: &str,
    command: &Command,
    publish: &mut impl FnMut(Response),
  ) -> Result<(), Error> {
    // Arguments are never logged here, only the command name: several
    // `cmd_*` entry points (LOGIN, AUTHENTICATE's initial response, APPEND)
    // carry credentials or message bodies as opaque arguments, and the
    // encoder picks their wire representation (atom/quoted/literal) from
    // content alone, so there is no cheap way to tell a safe argument from
    // a sensitive one at this layer.
    log::debug!("> {tag} {}...", String::from_utf8_lossy(&command.name));
    let literal_plus = self.literal_plus;
    // A synchronising literal may have any number of unrelated untagged
    // responses interleaved before the continuation request or the
    // tagged refusal arrives (§4.4/§4.5): loop, publishing each of them,
    // and only treat a *matching* tagged completion as a refusal. Any
    // other response — including an unrelated tagged completion, which
    // can't happen given one command in flight at a time, but is still
    // handled the same as `drain_until_tagged` — keeps the wait going.
    let encoded = command::encode(transport, tag, command, literal_plus, |transport| loop {
      let parsed = match self.read_one(transport) {
        Ok(parsed) => parsed,
        Err(error) => {
          self.health = Health::Broken;
          return Err(error.into());
        }
      };
      match parsed {
        ParsedLine::Continuation(_) => return Ok(true),
        ParsedLine::Response(response) => {
          self.note_response(&response);
          let is_final = response.tag == Tag::Tagged(tag.to_string());
          publish(response);
          if is_final {
            return Ok(false);
          }
        }
      }
    });
    match encoded {
      // The tagged refusal was already published from inside the closure
      // above, so there's nothing left to surface for either outcome.
      Ok(Encode::Sent | Encode::Aborted) => Ok(()),
      Err(error) => {
        self.health = Health::Broken;
        Err(Error::Transport(error))
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::VecDeque;

  struct ScriptedTransport {
    inbound: VecDeque<Vec<u8>>,
    written: Vec<u8>,
  }

  impl ScriptedTransport {
    fn new(lines: &[&[u8]]) -> Self {
      Self {
        inbound: lines.iter().map(|line| line.to_vec()).collect(),
        written: Vec::new(),
      }
    }
  }

  impl Transport for ScriptedTransport {
    fn read_line(&mut self) -> anyhow::Result<Vec<u8>> {
      self.inbound.pop_front().ok_or_else(|| anyhow::anyhow!("script exhausted"))
    }
    fn read_exact(&mut self, _n: usize) -> anyhow::Result<Vec<u8>> {
      anyhow::bail!("not exercised by these tests")
    }
    fn write(&mut self, octets: &[u8]) -> anyhow::Result<()> {
      self.written.extend_from_slice(octets);
      Ok(())
    }
    fn flush(&mut self) -> anyhow::Result<()> {
      Ok(())
    }
    fn wait_readable(&mut self, _timeout: Option<Duration>) -> anyhow::Result<bool> {
      Ok(false)
    }
    fn upgrade_tls(&mut self) -> bool {
      true
    }
    fn healthy(&self) -> bool {
      true
    }
  }

  #[test]
  fn capability_response_code_is_masked_and_recomputed() {
    let mut transport = ScriptedTransport::new(&[]);
    let mut engine = Engine::new([b"IMAP4REV1".to_vec()].into_iter().collect());
    let line = b"ym1 OK [CAPABILITY IMAP4rev1 LITERAL+ IDLE] done\r\n".to_vec();
    let parsed = response::parse_line(line, &mut transport).unwrap();
    let ParsedLine::Response(response) = parsed else {
      panic!("expected a response");
    };
    engine.note_response(&response);
    assert!(engine.literal_plus());
    assert!(engine.capabilities().contains(b"IDLE".as_slice()));
    assert!(!engine.capabilities().contains(b"IMAP4REV1".as_slice()));
  }

  #[test]
  fn idle_is_ended_with_done_before_the_next_command() {
    let mut transport = ScriptedTransport::new(&[
      b"+ idling\r\n",
      b"ym1 OK IDLE terminated\r\n",
    ]);
    let mut engine = Engine::new(HashSet::new());
    let mut published = Vec::new();

    let mut pending = Some(Pending {
      tag: "ym1".to_string(),
      command: Command::new("IDLE"),
      mechanism: None,
    });
    engine
      .step(
        &mut transport,
        Duration::from_millis(50),
        || pending.take(),
        |response| published.push(response),
      )
      .unwrap();
    assert!(engine.in_idle);

    let mut pending = Some(Pending {
      tag: "ym2".to_string(),
      command: Command::new("NOOP"),
      mechanism: None,
    });
    engine
      .step(
        &mut transport,
        Duration::from_millis(50),
        || pending.take(),
        |response| published.push(response),
      )
      .unwrap();

    assert!(!engine.in_idle);
    assert_eq!(
      b"ym1 IDLE\r\nDONE\r\nym2 NOOP\r\n".to_vec(),
      transport.written
    );
    assert_eq!(1, published.len());
    assert_eq!(Tag::Tagged("ym1".to_string()), published[0].tag);
  }

  #[test]
  fn unexpected_continuation_outside_a_special_flow_is_fatal() {
    struct OneShotReadable(bool);
    impl OneShotReadable {
      fn take(&mut self) -> bool {
        std::mem::replace(&mut self.0, false)
      }
    }

    struct SpuriousContinuationTransport {
      readable: OneShotReadable,
    }
    impl Transport for SpuriousContinuationTransport {
      fn read_line(&mut self) -> anyhow::Result<Vec<u8>> {
        Ok(b"+ spurious\r\n".to_vec())
      }
      fn read_exact(&mut self, _n: usize) -> anyhow::Result<Vec<u8>> {
        anyhow::bail!("not exercised")
      }
      fn write(&mut self, _octets: &[u8]) -> anyhow::Result<()> {
        Ok(())
      }
      fn flush(&mut self) -> anyhow::Result<()> {
        Ok(())
      }
      fn wait_readable(&mut self, _timeout: Option<Duration>) -> anyhow::Result<bool> {
        Ok(self.readable.take())
      }
      fn upgrade_tls(&mut self) -> bool {
        false
      }
      fn healthy(&self) -> bool {
        true
      }
    }

    let mut transport = SpuriousContinuationTransport {
      readable: OneShotReadable(true),
    };
    let mut engine = Engine::new(HashSet::new());
    let result = engine.step(
      &mut transport,
      Duration::from_millis(50),
      || None,
      |_response| panic!("no response should be published"),
    );
    assert!(result.is_err());
    assert_eq!(Health::Broken, engine.health());
  }

  #[test]
  fn generic_dispatch_survives_untagged_responses_interleaved_before_a_literal_continuation() {
    // A non-LITERAL+ literal must wait out any number of unrelated
    // untagged responses before its continuation request, not abort on
    // the first one (this is what distinguishes a real refusal — the
    // matching tagged completion — from ordinary async chatter).
    let mut transport = ScriptedTransport::new(&[
      b"* 3 EXPUNGE\r\n",
      b"* 1 RECENT\r\n",
      b"+ go ahead\r\n",
      b"ym1 OK APPEND completed\r\n",
    ]);
    let mut engine = Engine::new(HashSet::new());
    let mut published = Vec::new();

    let mut pending = Some(Pending {
      tag: "ym1".to_string(),
      command: Command::new("APPEND").opaque("line1\nline2"),
      mechanism: None,
    });
    engine
      .step(
        &mut transport,
        Duration::from_millis(50),
        || pending.take(),
        |response| published.push(response),
      )
      .unwrap();

    assert_eq!(Health::Healthy, engine.health());
    assert_eq!(
      b"ym1 APPEND {11}\r\nline1\nline2\r\n".to_vec(),
      transport.written
    );
    assert_eq!(3, published.len());
    assert_eq!(Tag::Untagged, published[0].tag);
    assert_eq!(Tag::Untagged, published[1].tag);
    assert_eq!(Tag::Tagged("ym1".to_string()), published[2].tag);
  }
}
