//! Pure string routines extracting the next token from a response line,
//! resolving literals by calling back into the transport for the exact
//! octet count plus one more line.
//!
//! Grounded on `_extract_string`/`_extract_astring` in
//! `python/ymaplib/IMAPParser.py`: same escape leniency, same literal
//! read-ahead shape, re-expressed over owned `Vec<u8>` lines instead of
//! Python's string slicing.

use crate::{error::Error, transport::Transport};

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
  Open,
  Close,
  Nil,
  Atom(Vec<u8>),
  /// A quoted string or literal payload; the two are indistinguishable
  /// once resolved, matching the grammar's `string = quoted / literal`.
  Str(Vec<u8>),
}

/// Drives token extraction over a line, fetching literal continuations
/// from `transport` as needed. One `Lexer` is built per response line and
/// consumed left to right; nested FETCH/THREAD data reuses the same
/// instance recursively (see `response.rs`).
pub struct Lexer<'a, T> {
  line: Vec<u8>,
  pos: usize,
  transport: &'a mut T,
}

fn strip_crlf(line: &[u8]) -> &[u8] {
  match line.len() {
    n if n >= 2 && &line[n - 2..] == b"\r\n" => &line[..n - 2],
    _ => line,
  }
}

impl<'a, T> Lexer<'a, T>
where
  T: Transport,
{
  pub fn new(line: Vec<u8>, transport: &'a mut T) -> Self {
    Self {
      line,
      pos: 0,
      transport,
    }
  }

  fn content_len(&self) -> usize {
    strip_crlf(&self.line).len()
  }

  pub fn at_end(&self) -> bool {
    self.pos >= self.content_len()
  }

  fn consume_one_space(&mut self) {
    if self.pos < self.content_len() && self.line[self.pos] == b' ' {
      self.pos += 1;
    }
  }

  /// Returns everything not yet consumed, CRLF stripped — used when a
  /// rule wants the rest of the line verbatim (human-readable text).
  pub fn rest(&self) -> &[u8] {
    &strip_crlf(&self.line)[self.pos..]
  }

  fn quoted(&mut self) -> Result<Vec<u8>, Error> {
    debug_assert_eq!(self.line[self.pos], b'"');
    self.pos += 1;
    let mut out = Vec::new();
    loop {
      if self.pos >= self.content_len() {
        return Err(Error::parse("unterminated quoted string"));
      }
      match self.line[self.pos] {
        b'"' => {
          self.pos += 1;
          return Ok(out);
        }
        b'\\' => {
          self.pos += 1;
          if self.pos >= self.content_len() {
            return Err(Error::parse("unterminated escape in quoted string"));
          }
          match self.line[self.pos] {
            c @ (b'\\' | b'"') => out.push(c),
            other => {
              log::debug!("non-fatal: unrecognised escape \\{}", other as char);
              out.push(b'\\');
              out.push(other);
            }
          }
          self.pos += 1;
        }
        c => {
          out.push(c);
          self.pos += 1;
        }
      }
    }
  }

  fn literal(&mut self) -> Result<Vec<u8>, Error> {
    debug_assert_eq!(self.line[self.pos], b'{');
    let start = self.pos + 1;
    let end = self.line[start..]
      .iter()
      .position(|b| *b == b'}')
      .map(|p| start + p)
      .ok_or_else(|| Error::parse("unterminated literal header"))?;
    let digits = &self.line[start..end];
    let plus = digits.last() == Some(&b'+');
    let digits = if plus { &digits[..digits.len() - 1] } else { digits };
    let n: usize = std::str::from_utf8(digits)
      .ok()
      .and_then(|s| s.parse().ok())
      .ok_or_else(|| Error::parse("invalid literal length"))?;

    let octets = self
      .transport
      .read_exact(n)
      .map_err(|error| Error::Transport(error))?;
    let fresh = self
      .transport
      .read_line()
      .map_err(|error| Error::Transport(error))?;
    self.line = fresh;
    self.pos = 0;
    Ok(octets)
  }

  fn atom_bytes(&mut self) -> Vec<u8> {
    let start = self.pos;
    while self.pos < self.content_len() {
      match self.line[self.pos] {
        b' ' | b'(' | b')' => break,
        _ => self.pos += 1,
      }
    }
    self.line[start..self.pos].to_vec()
  }

  pub fn token(&mut self) -> Result<Token, Error> {
    self.consume_one_space();
    if self.at_end() {
      return Err(Error::parse("expected a token, found end of line"));
    }
    let token = match self.line[self.pos] {
      b'(' => {
        self.pos += 1;
        Token::Open
      }
      b')' => {
        self.pos += 1;
        Token::Close
      }
      b'"' => Token::Str(self.quoted()?),
      b'{' => Token::Str(self.literal()?),
      _ => {
        let atom = self.atom_bytes();
        if atom.is_empty() {
          return Err(Error::parse("expected a token, found none"));
        }
        if atom.eq_ignore_ascii_case(b"nil") {
          Token::Nil
        } else {
          Token::Atom(atom)
        }
      }
    };
    self.consume_one_space();
    Ok(token)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::transport::Transport;
  use std::time;

  struct NullTransport;
  impl Transport for NullTransport {
    fn read_line(&mut self) -> anyhow::Result<Vec<u8>> {
      anyhow::bail!("no more input")
    }
    fn read_exact(&mut self, _n: usize) -> anyhow::Result<Vec<u8>> {
      anyhow::bail!("no more input")
    }
    fn write(&mut self, _octets: &[u8]) -> anyhow::Result<()> {
      Ok(())
    }
    fn flush(&mut self) -> anyhow::Result<()> {
      Ok(())
    }
    fn wait_readable(&mut self, _timeout: Option<time::Duration>) -> anyhow::Result<bool> {
      Ok(false)
    }
    fn upgrade_tls(&mut self) -> bool {
      false
    }
    fn healthy(&self) -> bool {
      true
    }
  }

  #[test]
  fn atoms_and_parens() {
    let mut transport = NullTransport;
    let mut lexer = Lexer::new(b"(FOO BAR)\r\n".to_vec(), &mut transport);
    assert_eq!(Token::Open, lexer.token().unwrap());
    assert_eq!(Token::Atom(b"FOO".to_vec()), lexer.token().unwrap());
    assert_eq!(Token::Atom(b"BAR".to_vec()), lexer.token().unwrap());
    assert_eq!(Token::Close, lexer.token().unwrap());
    assert!(lexer.at_end());
  }

  #[test]
  fn nil_marker() {
    let mut transport = NullTransport;
    let mut lexer = Lexer::new(b"NIL nil\r\n".to_vec(), &mut transport);
    assert_eq!(Token::Nil, lexer.token().unwrap());
    assert_eq!(Token::Nil, lexer.token().unwrap());
  }

  #[test]
  fn quoted_escapes() {
    let mut transport = NullTransport;
    let mut lexer = Lexer::new(br#""a\"b\\c\x""#.iter().chain(b"\r\n").cloned().collect(), &mut transport);
    assert_eq!(Token::Str(br#"a"b\c\x"#.to_vec()), lexer.token().unwrap());
  }

  #[test]
  fn unterminated_quote_is_parse_error() {
    let mut transport = NullTransport;
    let mut lexer = Lexer::new(b"\"abc\r\n".to_vec(), &mut transport);
    assert!(lexer.token().is_err());
  }

  struct LiteralTransport {
    octets: Vec<u8>,
    after: Vec<u8>,
  }
  impl Transport for LiteralTransport {
    fn read_line(&mut self) -> anyhow::Result<Vec<u8>> {
      Ok(std::mem::take(&mut self.after))
    }
    fn read_exact(&mut self, n: usize) -> anyhow::Result<Vec<u8>> {
      assert_eq!(n, self.octets.len());
      Ok(std::mem::take(&mut self.octets))
    }
    fn write(&mut self, _octets: &[u8]) -> anyhow::Result<()> {
      Ok(())
    }
    fn flush(&mut self) -> anyhow::Result<()> {
      Ok(())
    }
    fn wait_readable(&mut self, _timeout: Option<time::Duration>) -> anyhow::Result<bool> {
      Ok(false)
    }
    fn upgrade_tls(&mut self) -> bool {
      false
    }
    fn healthy(&self) -> bool {
      true
    }
  }

  #[test]
  fn literal_exactly_matches_advertised_length_including_embedded_crlf() {
    let body = b"line1\r\nline2".to_vec();
    let mut transport = LiteralTransport { octets: body.clone(), after: b"\r\n".to_vec() };
    let mut lexer = Lexer::new(format!("{{{}}}\r\n", body.len()).into_bytes(), &mut transport);
    assert_eq!(Token::Str(body), lexer.token().unwrap());
    assert!(lexer.at_end());
  }
}
