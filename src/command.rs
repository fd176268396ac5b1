//! Command encoder: serialises structured command values to octets,
//! choosing per argument the smallest safe representation, and emits the
//! tag.
//!
//! Grounded on the `cmd_*` constructors and the `for item in command`
//! encoding loop in `python/ymaplib/IMAPParser.py`, and on the teacher's
//! `Stream::input` buffering/logging conventions in `source/imap.rs`.

use crate::transport::Transport;

/// One structured command argument. The encoder picks atom / quoted /
/// literal / LITERAL+ form from the content at encode time — callers
/// never choose a representation up front.
#[derive(Debug, Clone, PartialEq)]
pub enum Argument {
  /// Emitted verbatim, preceded by a single space — used for keywords and
  /// other pieces the caller has already formatted (sequence sets, flag
  /// names, section specifiers).
  Preformatted(Vec<u8>),
  /// An opaque string the encoder frames as atom/quoted/literal.
  Opaque(Vec<u8>),
}

impl Argument {
  pub fn preformatted(text: impl Into<Vec<u8>>) -> Self {
    Self::Preformatted(text.into())
  }

  pub fn opaque(bytes: impl Into<Vec<u8>>) -> Self {
    Self::Opaque(bytes.into())
  }
}

/// A SASL mechanism descriptor, grounded on `authenticators.py`'s
/// `Authenticator` base class: a name plus a chat function answering each
/// base64-decoded server challenge with the next reply, or `None` to
/// cancel the exchange.
pub trait Mechanism {
  fn name(&self) -> &str;
  fn chat(&mut self, challenge: &[u8]) -> Option<Vec<u8>>;
}

/// SASL PLAIN, grounded on `authenticators.py::PLAINAuthenticator` and the
/// teacher's `imap::plain` encoder. Zeroizes the password on drop.
pub struct Plain {
  initial: Vec<u8>,
  sent: bool,
}

impl Plain {
  pub fn new(user: &str, mut password: String) -> Self {
    use zeroize::Zeroize as _;
    let initial = format!("\0{user}\0{password}").into_bytes();
    password.zeroize();
    Self {
      initial,
      sent: false,
    }
  }
}

impl Mechanism for Plain {
  fn name(&self) -> &str {
    "PLAIN"
  }

  fn chat(&mut self, _challenge: &[u8]) -> Option<Vec<u8>> {
    if self.sent {
      return None;
    }
    self.sent = true;
    Some(self.initial.clone())
  }
}

impl Drop for Plain {
  fn drop(&mut self) {
    use zeroize::Zeroize as _;
    self.initial.zeroize();
  }
}

/// Ordered command record: a name atom followed by arguments. The first
/// element is never an opaque-string holder.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
  pub name: Vec<u8>,
  pub arguments: Vec<Argument>,
}

impl Command {
  pub fn new(name: impl Into<Vec<u8>>) -> Self {
    Self {
      name: name.into(),
      arguments: Vec::new(),
    }
  }

  pub fn arg(mut self, argument: Argument) -> Self {
    self.arguments.push(argument);
    self
  }

  pub fn preformatted(self, text: impl Into<Vec<u8>>) -> Self {
    self.arg(Argument::preformatted(text))
  }

  pub fn opaque(self, bytes: impl Into<Vec<u8>>) -> Self {
    self.arg(Argument::opaque(bytes))
  }
}

fn narrowest(bytes: &[u8]) -> Representation {
  if bytes.is_empty() {
    return Representation::Quoted;
  }
  if bytes.iter().all(u8::is_ascii_alphanumeric) {
    return Representation::Atom;
  }
  if !bytes.contains(&b'\r') && !bytes.contains(&b'\n') {
    return Representation::Quoted;
  }
  Representation::Literal
}

enum Representation {
  Atom,
  Quoted,
  Literal,
}

fn quote(bytes: &[u8]) -> Vec<u8> {
  let mut out = Vec::with_capacity(bytes.len() + 2);
  out.push(b'"');
  for &b in bytes {
    if b == b'\\' || b == b'"' {
      out.push(b'\\');
    }
    out.push(b);
  }
  out.push(b'"');
  out
}

/// Outcome of encoding one command, consumed only by the engine loop's
/// command-dispatch code.
#[derive(Debug, PartialEq)]
pub enum Encode {
  /// The command line (and any synchronous literal octets) were fully
  /// sent.
  Sent,
  /// A non-LITERAL+ literal required a continuation request that never
  /// arrived (the server replied tagged-final instead); no further
  /// octets or trailing CRLF were sent.
  Aborted,
}

/// Encodes `tag SP command arguments… CRLF`, choosing representations
/// per §4.4. `await_continuation` is called only for a non-LITERAL+
/// literal: it must drive the transport until either a continuation
/// request (`Ok(true)`) or a tagged completion (`Ok(false)`) arrives.
pub fn encode<T, F>(
  transport: &mut T,
  tag: &str,
  command: &Command,
  literal_plus: bool,
  mut await_continuation: F,
) -> anyhow::Result<Encode>
where
  T: Transport,
  F: FnMut(&mut T) -> anyhow::Result<bool>,
{
  transport.write(tag.as_bytes())?;
  transport.write(b" ")?;
  transport.write(&command.name)?;

  for argument in &command.arguments {
    transport.write(b" ")?;
    match argument {
      Argument::Preformatted(bytes) => transport.write(bytes)?,
      Argument::Opaque(bytes) => match narrowest(bytes) {
        Representation::Atom => transport.write(bytes)?,
        Representation::Quoted => transport.write(&quote(bytes))?,
        Representation::Literal => {
          if literal_plus {
            transport.write(format!("{{{}+}}\r\n", bytes.len()).as_bytes())?;
            transport.write(bytes)?;
          } else {
            transport.write(format!("{{{}}}\r\n", bytes.len()).as_bytes())?;
            transport.flush()?;
            if !await_continuation(transport)? {
              return Ok(Encode::Aborted);
            }
            transport.write(bytes)?;
          }
        }
      },
    }
  }

  transport.write(b"\r\n")?;
  transport.flush()?;
  Ok(Encode::Sent)
}
