//! Response records: tokenisation and structural parsing of every form
//! specified by RFC 3501 §7 plus the SORT/THREAD extensions and the FETCH
//! data grammar.
//!
//! Grounded on `_parse_line` / `_parse_response_code` / `_parse_response_data`
//! / `_parse_fetch_response` / `_parse_thread_response` in
//! `python/ymaplib/IMAPParser.py`. The FETCH and THREAD sub-parsers are
//! re-expressed as explicit-stack iterative parsers per the "recursive
//! parenthesised data" design note, instead of the original's
//! string-slicing recursion.

use crate::{
  error::{escape, Error},
  lexer::{Lexer, Token},
  transport::Transport,
};

/// A value that may be the literal `NIL`, distinct from an empty string,
/// an empty list, or any numeric zero.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Nillable<T> {
  #[default]
  Nil,
  Present(T),
}

impl<T> Nillable<T> {
  pub fn as_ref(&self) -> Nillable<&T> {
    match self {
      Self::Nil => Nillable::Nil,
      Self::Present(value) => Nillable::Present(value),
    }
  }

  pub fn into_option(self) -> Option<T> {
    match self {
      Self::Nil => None,
      Self::Present(value) => Some(value),
    }
  }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Tag {
  Untagged,
  Tagged(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
  Ok,
  No,
  Bad,
  Preauth,
  Bye,
  Capability,
  List,
  Lsub,
  Status,
  Search,
  Flags,
  Exists,
  Recent,
  Expunge,
  Fetch,
  Sort,
  Thread,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CodePayload {
  None,
  Integer(u64),
  String(Vec<u8>),
  Atoms(Vec<Vec<u8>>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResponseCode {
  pub name: Vec<u8>,
  pub payload: CodePayload,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Address {
  pub display_name: Nillable<Vec<u8>>,
  pub source_route: Nillable<Vec<u8>>,
  pub mailbox: Nillable<Vec<u8>>,
  pub host: Nillable<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Envelope {
  /// Parsed as a Unix timestamp from the RFC 2822-style date string, same
  /// treatment `IMAPEnvelope.__init__` gives it via
  /// `email.Utils.mktime_tz(email.Utils.parsedate_tz(date))`.
  pub date: Nillable<i64>,
  pub subject: Nillable<Vec<u8>>,
  pub from: Vec<Address>,
  pub sender: Vec<Address>,
  pub reply_to: Vec<Address>,
  pub to: Vec<Address>,
  pub cc: Vec<Address>,
  pub bcc: Vec<Address>,
  pub in_reply_to: Nillable<Vec<u8>>,
  pub message_id: Nillable<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ThreadNode {
  pub id: Option<u64>,
  pub children: Option<Vec<ThreadNode>>,
}

/// A FETCH-data value not given a dedicated decoding (any key other than
/// `ENVELOPE` / `RFC822.SIZE` / `FLAGS` / `INTERNALDATE`): the raw token
/// or parenthesised tuple, preserved structurally.
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
  Nil,
  Atom(Vec<u8>),
  Str(Vec<u8>),
  List(Vec<RawValue>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum FetchValue {
  Envelope(Envelope),
  Size(u64),
  Flags(Vec<Vec<u8>>),
  InternalDate(Nillable<i64>),
  Raw(RawValue),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Data {
  None,
  Text(Vec<u8>),
  Capability(Vec<Vec<u8>>),
  List {
    flags: Vec<Vec<u8>>,
    delimiter: Nillable<Vec<u8>>,
    name: Vec<u8>,
  },
  Status {
    mailbox: Vec<u8>,
    attributes: Vec<(Vec<u8>, u64)>,
  },
  Numbers(Vec<u64>),
  Flags(Vec<Vec<u8>>),
  Number(u64),
  Fetch {
    index: u64,
    attributes: Vec<(Vec<u8>, FetchValue)>,
  },
  Thread(Vec<ThreadNode>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
  pub tag: Tag,
  pub kind: Kind,
  pub response_code: Option<ResponseCode>,
  pub data: Data,
}

/// A parsed line is either an ordinary response or a bare continuation
/// request — the latter is an event the engine loop reacts to, never an
/// error (see the "state machine vs coroutine flows" design note).
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedLine {
  Continuation(Vec<u8>),
  Response(Response),
}

fn strip_crlf(line: &[u8]) -> &[u8] {
  match line.len() {
    n if n >= 2 && &line[n - 2..] == b"\r\n" => &line[..n - 2],
    _ => line,
  }
}

fn upper(bytes: &[u8]) -> Vec<u8> {
  bytes.to_ascii_uppercase()
}

fn is_tag(bytes: &[u8]) -> bool {
  bytes.len() > 2 && &bytes[..2] == b"ym" && bytes[2..].iter().all(u8::is_ascii_digit)
}

fn parse_u64(bytes: &[u8]) -> Option<u64> {
  std::str::from_utf8(bytes).ok()?.parse().ok()
}

/// Parses one framed line, consulting `transport` only to resolve
/// literals the lexer encounters along the way.
pub fn parse_line<T: Transport>(line: Vec<u8>, transport: &mut T) -> Result<ParsedLine, Error> {
  let space = line
    .iter()
    .position(|b| *b == b' ')
    .ok_or_else(|| Error::InvalidResponse("missing prefix separator".into()))?;
  let prefix = line[..space].to_vec();

  if prefix == b"+" {
    let rest = strip_crlf(&line[space + 1..]).to_vec();
    return Ok(ParsedLine::Continuation(rest));
  }

  let tag = if prefix == b"*" {
    Tag::Untagged
  } else if is_tag(&prefix) {
    Tag::Tagged(String::from_utf8_lossy(&prefix).into_owned())
  } else {
    return Err(Error::InvalidResponse(format!(
      "unrecognised tag \"{}\"",
      escape(&prefix)
    )));
  };

  let body = line[space + 1..].to_vec();
  let mut lexer = Lexer::new(body, transport);
  let first = lexer.token()?;
  let Token::Atom(first) = first else {
    return Err(Error::UnknownResponse("expected an atom".into()));
  };
  let upper_first = upper(&first);

  match upper_first.as_slice() {
    b"OK" | b"NO" | b"BAD" | b"PREAUTH" | b"BYE" => {
      let kind = match upper_first.as_slice() {
        b"OK" => Kind::Ok,
        b"NO" => Kind::No,
        b"BAD" => Kind::Bad,
        b"PREAUTH" => Kind::Preauth,
        b"BYE" => Kind::Bye,
        _ => unreachable!(),
      };
      let (code, text) = parse_resp_text(lexer.rest())?;
      Ok(ParsedLine::Response(Response {
        tag,
        kind,
        response_code: code,
        data: Data::Text(text),
      }))
    }
    b"CAPABILITY" => {
      let atoms = rest_atoms(&mut lexer)?;
      Ok(ParsedLine::Response(Response {
        tag,
        kind: Kind::Capability,
        response_code: None,
        data: Data::Capability(atoms.into_iter().map(|a| upper(&a)).collect()),
      }))
    }
    b"LIST" | b"LSUB" => {
      let kind = if upper_first == b"LIST" {
        Kind::List
      } else {
        Kind::Lsub
      };
      let data = parse_list_data(&mut lexer)?;
      Ok(ParsedLine::Response(Response {
        tag,
        kind,
        response_code: None,
        data,
      }))
    }
    b"STATUS" => {
      let data = parse_status_data(&mut lexer)?;
      Ok(ParsedLine::Response(Response {
        tag,
        kind: Kind::Status,
        response_code: None,
        data,
      }))
    }
    b"SEARCH" | b"SORT" => {
      let kind = if upper_first == b"SEARCH" {
        Kind::Search
      } else {
        Kind::Sort
      };
      let numbers = rest_numbers(&mut lexer)?;
      Ok(ParsedLine::Response(Response {
        tag,
        kind,
        response_code: None,
        data: Data::Numbers(numbers),
      }))
    }
    b"FLAGS" => {
      let flags = parse_paren_atoms(&mut lexer)?;
      Ok(ParsedLine::Response(Response {
        tag,
        kind: Kind::Flags,
        response_code: None,
        data: Data::Flags(flags.into_iter().map(|a| upper(&a)).collect()),
      }))
    }
    b"THREAD" => {
      let nodes = parse_thread(lexer.rest())?;
      Ok(ParsedLine::Response(Response {
        tag,
        kind: Kind::Thread,
        response_code: None,
        data: Data::Thread(nodes),
      }))
    }
    digits if digits.iter().all(u8::is_ascii_digit) && !digits.is_empty() => {
      let index = parse_u64(digits).ok_or_else(|| Error::parse("invalid message number"))?;
      let next = lexer.token()?;
      let Token::Atom(next) = next else {
        return Err(Error::UnknownResponse("expected EXISTS/RECENT/EXPUNGE/FETCH".into()));
      };
      match upper(&next).as_slice() {
        b"EXISTS" => Ok(ParsedLine::Response(Response {
          tag,
          kind: Kind::Exists,
          response_code: None,
          data: Data::Number(index),
        })),
        b"RECENT" => Ok(ParsedLine::Response(Response {
          tag,
          kind: Kind::Recent,
          response_code: None,
          data: Data::Number(index),
        })),
        b"EXPUNGE" => Ok(ParsedLine::Response(Response {
          tag,
          kind: Kind::Expunge,
          response_code: None,
          data: Data::Number(index),
        })),
        b"FETCH" => {
          let attributes = parse_fetch_data(&mut lexer)?;
          Ok(ParsedLine::Response(Response {
            tag,
            kind: Kind::Fetch,
            response_code: None,
            data: Data::Fetch { index, attributes },
          }))
        }
        other => Err(Error::UnknownResponse(format!(
          "unexpected message-status atom \"{}\"",
          escape(other)
        ))),
      }
    }
    other => Err(Error::UnknownResponse(format!("\"{}\"", escape(other)))),
  }
}

fn rest_atoms<T: Transport>(lexer: &mut Lexer<'_, T>) -> Result<Vec<Vec<u8>>, Error> {
  let mut out = Vec::new();
  while !lexer.at_end() {
    match lexer.token()? {
      Token::Atom(bytes) => out.push(bytes),
      other => return Err(Error::parse(format!("expected an atom, found {other:?}"))),
    }
  }
  Ok(out)
}

fn rest_numbers<T: Transport>(lexer: &mut Lexer<'_, T>) -> Result<Vec<u64>, Error> {
  rest_atoms(lexer)?
    .into_iter()
    .map(|bytes| parse_u64(&bytes).ok_or_else(|| Error::parse("expected an integer")))
    .collect()
}

fn parse_paren_atoms<T: Transport>(lexer: &mut Lexer<'_, T>) -> Result<Vec<Vec<u8>>, Error> {
  match lexer.token()? {
    Token::Open => (),
    other => return Err(Error::parse(format!("expected '(', found {other:?}"))),
  }
  let mut out = Vec::new();
  loop {
    match lexer.token()? {
      Token::Close => return Ok(out),
      Token::Atom(bytes) => out.push(bytes),
      other => return Err(Error::parse(format!("expected an atom or ')', found {other:?}"))),
    }
  }
}

fn astring_bytes<T: Transport>(lexer: &mut Lexer<'_, T>) -> Result<Vec<u8>, Error> {
  match lexer.token()? {
    Token::Atom(bytes) | Token::Str(bytes) => Ok(bytes),
    other => Err(Error::parse(format!("expected an astring, found {other:?}"))),
  }
}

fn parse_list_data<T: Transport>(lexer: &mut Lexer<'_, T>) -> Result<Data, Error> {
  let flags = parse_paren_atoms(lexer)?;
  let delimiter = match lexer.token()? {
    Token::Nil => Nillable::Nil,
    Token::Str(bytes) if !bytes.is_empty() => Nillable::Present(bytes),
    other => return Err(Error::parse(format!("invalid LIST delimiter {other:?}"))),
  };
  let name = astring_bytes(lexer)?;
  if name.is_empty() {
    return Err(Error::parse("empty LIST mailbox name"));
  }
  Ok(Data::List {
    flags: flags.into_iter().map(|a| upper(&a)).collect(),
    delimiter,
    name,
  })
}

fn parse_status_data<T: Transport>(lexer: &mut Lexer<'_, T>) -> Result<Data, Error> {
  let mailbox = astring_bytes(lexer)?;
  match lexer.token()? {
    Token::Open => (),
    other => return Err(Error::parse(format!("expected '(', found {other:?}"))),
  }
  let mut items = Vec::new();
  loop {
    match lexer.token()? {
      Token::Close => break,
      Token::Atom(bytes) => items.push(bytes),
      other => return Err(Error::parse(format!("expected an atom or ')', found {other:?}"))),
    }
  }
  if items.len() % 2 != 0 {
    return Err(Error::parse("STATUS attribute list has an odd item count"));
  }
  let mut attributes = Vec::with_capacity(items.len() / 2);
  for pair in items.chunks(2) {
    let value = parse_u64(&pair[1]).ok_or_else(|| Error::parse("non-numeric STATUS value"))?;
    attributes.push((upper(&pair[0]), value));
  }
  Ok(Data::Status { mailbox, attributes })
}

fn parse_resp_text(rest: &[u8]) -> Result<(Option<ResponseCode>, Vec<u8>), Error> {
  let rest = strip_crlf(rest);
  if rest.first() != Some(&b'[') {
    return Ok((None, rest.to_vec()));
  }
  let close = rest
    .iter()
    .position(|b| *b == b']')
    .ok_or_else(|| Error::parse("unterminated response code"))?;
  let code = parse_code(&rest[1..close])?;
  let mut start = close + 1;
  if rest.get(start) == Some(&b' ') {
    start += 1;
  }
  Ok((Some(code), rest[start..].to_vec()))
}

fn parse_code(content: &[u8]) -> Result<ResponseCode, Error> {
  let space = content.iter().position(|b| *b == b' ');
  let (name, arg) = match space {
    Some(p) => (&content[..p], &content[p + 1..]),
    None => (content, &content[content.len()..]),
  };
  let name_upper = upper(name);
  let payload = match name_upper.as_slice() {
    b"ALERT" | b"PARSE" | b"READ-ONLY" | b"READ-WRITE" | b"TRYCREATE" => CodePayload::None,
    b"UIDNEXT" | b"UIDVALIDITY" | b"UNSEEN" => match parse_u64(arg) {
      Some(n) => CodePayload::Integer(n),
      None => CodePayload::String(arg.to_vec()),
    },
    b"CAPABILITY" => CodePayload::Atoms(arg.split(|b| *b == b' ').filter(|s| !s.is_empty()).map(upper).collect()),
    b"PERMANENTFLAGS" | b"BADCHARSET" => {
      let inner = arg
        .strip_prefix(b"(")
        .and_then(|rest| rest.strip_suffix(b")"))
        .ok_or_else(|| Error::parse("expected a parenthesised atom list"))?;
      CodePayload::Atoms(inner.split(|b| *b == b' ').filter(|s| !s.is_empty()).map(upper).collect())
    }
    _ if arg.is_empty() => CodePayload::None,
    _ => CodePayload::String(arg.to_vec()),
  };
  Ok(ResponseCode {
    name: name_upper,
    payload,
  })
}

// --- FETCH data sub-parser (§4.3.1) -----------------------------------

fn parse_fetch_data<T: Transport>(lexer: &mut Lexer<'_, T>) -> Result<Vec<(Vec<u8>, FetchValue)>, Error> {
  match lexer.token()? {
    Token::Open => (),
    // Leniency for buggy servers: if the data doesn't begin with '(', a
    // single closing ')' is appended and parsing continues.
    other => return parse_fetch_items(lexer, Some(other)),
  }
  parse_fetch_items(lexer, None)
}

fn parse_fetch_items<T: Transport>(
  lexer: &mut Lexer<'_, T>,
  pushback: Option<Token>,
) -> Result<Vec<(Vec<u8>, FetchValue)>, Error> {
  let mut tokens = Vec::new();
  if let Some(token) = pushback {
    tokens.push(token);
  }
  loop {
    match lexer.token() {
      Ok(Token::Close) => break,
      Ok(token) => tokens.push(token),
      Err(_) if lexer.at_end() => break, // leniency: missing trailing ')'
      Err(error) => return Err(error),
    }
  }

  let mut items: Vec<RawValue> = Vec::new();
  let mut stack: Vec<Vec<RawValue>> = Vec::new();
  let mut cursor = tokens.into_iter().peekable();
  while let Some(token) = cursor.next() {
    match token {
      Token::Open => stack.push(Vec::new()),
      Token::Close => {
        let finished = stack.pop().ok_or_else(|| Error::parse("unbalanced ')' in FETCH data"))?;
        let value = RawValue::List(finished);
        match stack.last_mut() {
          Some(top) => top.push(value),
          None => items.push(value),
        }
      }
      Token::Nil => {
        let value = RawValue::Nil;
        match stack.last_mut() {
          Some(top) => top.push(value),
          None => items.push(value),
        }
      }
      Token::Atom(bytes) => {
        let value = RawValue::Atom(bytes);
        match stack.last_mut() {
          Some(top) => top.push(value),
          None => items.push(value),
        }
      }
      Token::Str(bytes) => {
        let value = RawValue::Str(bytes);
        match stack.last_mut() {
          Some(top) => top.push(value),
          None => items.push(value),
        }
      }
    }
  }
  if !stack.is_empty() {
    return Err(Error::parse("unbalanced '(' in FETCH data"));
  }

  // Merge key continuations: a key spans multiple items while its
  // bracket/angle-bracket depth is unbalanced (e.g.
  // `BODY[HEADER.FIELDS (FROM DATE)]`, `BODY[]<0.512>`).
  let merged = merge_fetch_keys(items)?;
  if merged.len() % 2 != 0 {
    return Err(Error::parse("FETCH data has an odd item count"));
  }

  let mut attributes = Vec::with_capacity(merged.len() / 2);
  for pair in merged.chunks(2) {
    let key = match &pair[0] {
      RawValue::Atom(bytes) => upper(bytes),
      other => return Err(Error::parse(format!("expected a FETCH key, found {other:?}"))),
    };
    let value = decode_fetch_value(&key, pair[1].clone())?;
    attributes.push((key, value));
  }
  Ok(attributes)
}

fn bracket_balance(bytes: &[u8]) -> i64 {
  let mut balance = 0i64;
  for &b in bytes {
    match b {
      b'[' | b'<' => balance += 1,
      b']' | b'>' => balance -= 1,
      _ => (),
    }
  }
  balance
}

/// Folds consecutive atom keys whose bracket/angle-bracket depth hasn't
/// balanced back into one key, upper-casing everything but any
/// parenthesised run's internal atoms, which stay verbatim (field names
/// inside `HEADER.FIELDS (...)` are themselves already upper by
/// convention but not forced).
fn merge_fetch_keys(items: Vec<RawValue>) -> Result<Vec<RawValue>, Error> {
  let mut out: Vec<RawValue> = Vec::new();
  let mut pending_key: Option<(Vec<u8>, i64)> = None;
  for item in items {
    if let Some((key, balance)) = pending_key.take() {
      let addition = match &item {
        RawValue::Atom(bytes) => bytes.clone(),
        RawValue::List(_) => render_raw(&item),
        _ => return Err(Error::parse("unexpected token while continuing a FETCH key")),
      };
      let merged = [key, b" ".to_vec(), addition].concat();
      let new_balance = balance + bracket_balance(&addition);
      if new_balance > 0 {
        pending_key = Some((merged, new_balance));
      } else {
        out.push(RawValue::Atom(merged));
      }
      continue;
    }
    match &item {
      RawValue::Atom(bytes) => {
        let balance = bracket_balance(bytes);
        if balance > 0 {
          pending_key = Some((bytes.clone(), balance));
        } else {
          out.push(item);
        }
      }
      _ => out.push(item),
    }
  }
  if pending_key.is_some() {
    return Err(Error::parse("unbalanced brackets in a FETCH key"));
  }
  Ok(out)
}

fn render_raw(value: &RawValue) -> Vec<u8> {
  match value {
    RawValue::Nil => b"NIL".to_vec(),
    RawValue::Atom(bytes) | RawValue::Str(bytes) => bytes.clone(),
    RawValue::List(items) => {
      let mut out = vec![b'('];
      for (i, item) in items.iter().enumerate() {
        if i > 0 {
          out.push(b' ');
        }
        out.extend(render_raw(item));
      }
      out.push(b')');
      out
    }
  }
}

fn decode_fetch_value(key: &[u8], value: RawValue) -> Result<FetchValue, Error> {
  match key {
    b"RFC822.SIZE" => match &value {
      RawValue::Atom(bytes) => {
        parse_u64(bytes).map(FetchValue::Size).ok_or_else(|| Error::parse("non-numeric RFC822.SIZE"))
      }
      _ => Err(Error::parse("non-numeric RFC822.SIZE")),
    },
    b"FLAGS" => match value {
      RawValue::List(items) => Ok(FetchValue::Flags(
        items
          .into_iter()
          .map(|item| match item {
            RawValue::Atom(bytes) => Ok(upper(&bytes)),
            other => Err(Error::parse(format!("expected a flag atom, found {other:?}"))),
          })
          .collect::<Result<_, _>>()?,
      )),
      other => Err(Error::parse(format!("expected a FLAGS list, found {other:?}"))),
    },
    b"INTERNALDATE" => Ok(FetchValue::InternalDate(decode_date(&value)?)),
    b"ENVELOPE" => Ok(FetchValue::Envelope(decode_envelope(value)?)),
    _ => Ok(FetchValue::Raw(value)),
  }
}

fn decode_date(value: &RawValue) -> Result<Nillable<i64>, Error> {
  match value {
    RawValue::Nil => Ok(Nillable::Nil),
    RawValue::Str(bytes) | RawValue::Atom(bytes) => {
      let text = std::str::from_utf8(bytes).map_err(|_| Error::parse("invalid date encoding"))?;
      chrono::DateTime::parse_from_rfc2822(text.trim())
        .map(|dt| Nillable::Present(dt.timestamp()))
        .map_err(|error| Error::parse(format!("invalid date {text:?}: {error}")))
    }
    other => Err(Error::parse(format!("expected a date string, found {other:?}"))),
  }
}

fn nillable_string(value: RawValue) -> Result<Nillable<Vec<u8>>, Error> {
  match value {
    RawValue::Nil => Ok(Nillable::Nil),
    RawValue::Str(bytes) | RawValue::Atom(bytes) => Ok(Nillable::Present(bytes)),
    other => Err(Error::parse(format!("expected a string or NIL, found {other:?}"))),
  }
}

fn decode_address_list(value: RawValue) -> Result<Vec<Address>, Error> {
  match value {
    RawValue::Nil => Ok(Vec::new()),
    RawValue::List(entries) => entries.into_iter().map(decode_address).collect(),
    other => Err(Error::parse(format!("expected an address list, found {other:?}"))),
  }
}

fn decode_address(value: RawValue) -> Result<Address, Error> {
  match value {
    RawValue::List(fields) if fields.len() == 4 => {
      let mut fields = fields.into_iter();
      Ok(Address {
        display_name: nillable_string(fields.next().unwrap())?,
        source_route: nillable_string(fields.next().unwrap())?,
        mailbox: nillable_string(fields.next().unwrap())?,
        host: nillable_string(fields.next().unwrap())?,
      })
    }
    other => Err(Error::parse(format!("expected a 4-tuple address, found {other:?}"))),
  }
}

fn decode_envelope(value: RawValue) -> Result<Envelope, Error> {
  let RawValue::List(fields) = value else {
    return Err(Error::parse("expected a 10-tuple ENVELOPE"));
  };
  if fields.len() != 10 {
    return Err(Error::parse(format!(
      "ENVELOPE has {} fields, expected 10",
      fields.len()
    )));
  }
  let mut fields = fields.into_iter();
  Ok(Envelope {
    date: decode_date(&fields.next().unwrap())?,
    subject: nillable_string(fields.next().unwrap())?,
    from: decode_address_list(fields.next().unwrap())?,
    sender: decode_address_list(fields.next().unwrap())?,
    reply_to: decode_address_list(fields.next().unwrap())?,
    to: decode_address_list(fields.next().unwrap())?,
    cc: decode_address_list(fields.next().unwrap())?,
    bcc: decode_address_list(fields.next().unwrap())?,
    in_reply_to: nillable_string(fields.next().unwrap())?,
    message_id: nillable_string(fields.next().unwrap())?,
  })
}

// --- THREAD sub-parser (§4.3.2) ----------------------------------------

const DEFAULT_THREAD_DEPTH: usize = 32;

#[derive(Debug, Clone, Copy)]
enum ThreadToken {
  Open,
  Close,
  Digit(u64),
}

fn tokenize_thread(bytes: &[u8]) -> Result<Vec<ThreadToken>, Error> {
  let mut out = Vec::new();
  let mut i = 0;
  while i < bytes.len() {
    match bytes[i] {
      b' ' => i += 1,
      b'(' => {
        out.push(ThreadToken::Open);
        i += 1;
      }
      b')' => {
        out.push(ThreadToken::Close);
        i += 1;
      }
      b'0'..=b'9' => {
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
          i += 1;
        }
        let n = parse_u64(&bytes[start..i]).ok_or_else(|| Error::parse("invalid THREAD identifier"))?;
        out.push(ThreadToken::Digit(n));
      }
      other => return Err(Error::parse(format!("unexpected byte {other} in THREAD data"))),
    }
  }
  Ok(out)
}

struct ThreadFrame {
  siblings: Vec<ThreadNode>,
  tail_path: Vec<usize>,
  is_root: bool,
}

fn navigate_mut<'a>(siblings: &'a mut [ThreadNode], path: &[usize]) -> &'a mut ThreadNode {
  let mut node = &mut siblings[path[0]];
  for &index in &path[1..] {
    node = &mut node.children.as_mut().expect("tail_path points through a childless node")[index];
  }
  node
}

pub fn parse_thread(bytes: &[u8]) -> Result<Vec<ThreadNode>, Error> {
  parse_thread_with_depth(bytes, DEFAULT_THREAD_DEPTH)
}

fn parse_thread_with_depth(bytes: &[u8], max_depth: usize) -> Result<Vec<ThreadNode>, Error> {
  let bytes = strip_crlf(bytes);
  let tokens = tokenize_thread(bytes)?;
  if tokens.is_empty() {
    return Err(Error::parse("empty THREAD data"));
  }

  let mut stack = vec![ThreadFrame {
    siblings: Vec::new(),
    tail_path: Vec::new(),
    is_root: true,
  }];

  for token in tokens {
    match token {
      ThreadToken::Digit(id) => {
        let frame = stack.last_mut().expect("root frame always present");
        if frame.is_root {
          return Err(Error::parse("unexpected digit at the top level of THREAD data"));
        }
        let node = ThreadNode {
          id: Some(id),
          children: None,
        };
        if frame.tail_path.is_empty() {
          frame.siblings.push(node);
          frame.tail_path = vec![frame.siblings.len() - 1];
        } else {
          navigate_mut(&mut frame.siblings, &frame.tail_path).children = Some(vec![node]);
          frame.tail_path.push(0);
        }
      }
      ThreadToken::Open => {
        if stack.len() >= max_depth {
          return Err(Error::parse("THREAD data nested too deeply"));
        }
        let frame = stack.last_mut().expect("root frame always present");
        if !frame.is_root && frame.tail_path.is_empty() {
          frame.siblings.push(ThreadNode {
            id: None,
            children: None,
          });
          frame.tail_path = vec![frame.siblings.len() - 1];
        }
        stack.push(ThreadFrame {
          siblings: Vec::new(),
          tail_path: Vec::new(),
          is_root: false,
        });
      }
      ThreadToken::Close => {
        let finished = stack.pop().ok_or_else(|| Error::parse("mismatched ')' in THREAD data"))?;
        let parent = stack
          .last_mut()
          .ok_or_else(|| Error::parse("mismatched ')' in THREAD data"))?;
        if parent.is_root {
          parent.siblings.extend(finished.siblings);
        } else {
          let target = navigate_mut(&mut parent.siblings, &parent.tail_path);
          match &mut target.children {
            Some(children) => children.extend(finished.siblings),
            None => target.children = Some(finished.siblings),
          }
        }
      }
    }
  }

  if stack.len() != 1 {
    return Err(Error::parse("mismatched '(' in THREAD data"));
  }
  Ok(stack.pop().unwrap().siblings)
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;
  use test_log::test;

  fn leaf(id: u64) -> ThreadNode {
    ThreadNode {
      id: Some(id),
      children: None,
    }
  }

  fn chain(ids: &[u64], children: Option<Vec<ThreadNode>>) -> ThreadNode {
    let mut node = ThreadNode {
      id: Some(ids[0]),
      children: None,
    };
    if ids.len() > 1 {
      node.children = Some(vec![chain(&ids[1..], children)]);
    } else {
      node.children = children;
    }
    node
  }

  #[test]
  fn thread_empty() {
    assert_eq!(Vec::<ThreadNode>::new(), parse_thread(b"()").unwrap());
  }

  #[test]
  fn thread_chain() {
    assert_eq!(vec![chain(&[1, 2, 3], None)], parse_thread(b"(1 2 3)").unwrap());
  }

  #[test]
  fn thread_two_roots() {
    assert_eq!(
      vec![leaf(1), chain(&[2, 3], None)],
      parse_thread(b"(1)(2 3)").unwrap()
    );
  }

  #[test]
  fn thread_branching() {
    let expected = vec![
      leaf(2),
      chain(
        &[3, 6],
        Some(vec![chain(&[4, 23], None), chain(&[44, 7, 96], None)]),
      ),
    ];
    assert_eq!(expected, parse_thread(b"(2)(3 6 (4 23)(44 7 96))").unwrap());
  }

  #[test]
  fn thread_synthetic_grouping() {
    let expected = vec![ThreadNode {
      id: None,
      children: Some(vec![leaf(3), leaf(5)]),
    }];
    assert_eq!(expected, parse_thread(b"((3)(5))").unwrap());
  }

  #[test]
  fn thread_mismatched_parens_is_parse_error() {
    assert!(parse_thread(b"(1 2").is_err());
    assert!(parse_thread(b"1 2)").is_err());
  }

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
    fn wait_readable(&mut self, _timeout: Option<std::time::Duration>) -> anyhow::Result<bool> {
      Ok(false)
    }
    fn upgrade_tls(&mut self) -> bool {
      false
    }
    fn healthy(&self) -> bool {
      true
    }
  }

  fn parse(line: &[u8]) -> ParsedLine {
    let mut transport = NullTransport;
    parse_line(line.to_vec(), &mut transport).unwrap()
  }

  #[test]
  fn preauth_with_capability_code() {
    let ParsedLine::Response(response) =
      parse(b"* PREAUTH [CAPABILITY IMAP4rev1 LITERAL+ IDLE] hello\r\n")
    else {
      panic!("expected a response");
    };
    assert_eq!(Tag::Untagged, response.tag);
    assert_eq!(Kind::Preauth, response.kind);
    assert_eq!(
      Some(ResponseCode {
        name: b"CAPABILITY".to_vec(),
        payload: CodePayload::Atoms(vec![
          b"IMAP4REV1".to_vec(),
          b"LITERAL+".to_vec(),
          b"IDLE".to_vec(),
        ]),
      }),
      response.response_code
    );
    assert_eq!(Data::Text(b"hello".to_vec()), response.data);
  }

  #[test]
  fn capability_response() {
    let ParsedLine::Response(response) = parse(b"* CAPABILITY IMAP4rev1 SORT\r\n") else {
      panic!("expected a response");
    };
    assert_eq!(Kind::Capability, response.kind);
    assert_eq!(
      Data::Capability(vec![b"IMAP4REV1".to_vec(), b"SORT".to_vec()]),
      response.data
    );
  }

  #[test]
  fn list_response() {
    let ParsedLine::Response(response) = parse(b"* LIST (\\Marked) \"/\" INBOX.Work\r\n") else {
      panic!("expected a response");
    };
    assert_eq!(Kind::List, response.kind);
    assert_eq!(
      Data::List {
        flags: vec![b"\\MARKED".to_vec()],
        delimiter: Nillable::Present(b"/".to_vec()),
        name: b"INBOX.Work".to_vec(),
      },
      response.data
    );
  }

  #[test]
  fn status_response() {
    let ParsedLine::Response(response) = parse(b"* STATUS \"foo\" (MESSAGES 231 UIDNEXT 44292)\r\n")
    else {
      panic!("expected a response");
    };
    assert_eq!(Kind::Status, response.kind);
    assert_eq!(
      Data::Status {
        mailbox: b"foo".to_vec(),
        attributes: vec![(b"MESSAGES".to_vec(), 231), (b"UIDNEXT".to_vec(), 44292)],
      },
      response.data
    );
  }

  #[test]
  fn status_response_with_empty_attribute_list() {
    let ParsedLine::Response(response) = parse(b"* STATUS \"foo\" ()\r\n") else {
      panic!("expected a response");
    };
    assert_eq!(Kind::Status, response.kind);
    assert_eq!(
      Data::Status {
        mailbox: b"foo".to_vec(),
        attributes: vec![],
      },
      response.data
    );
  }

  #[test]
  fn status_response_with_odd_item_count_is_parse_error() {
    let mut transport = NullTransport;
    let error = parse_line(b"* STATUS \"foo\" (MESSAGES 231 UIDNEXT)\r\n".to_vec(), &mut transport)
      .unwrap_err();
    assert!(matches!(error, Error::Parse { .. }), "expected Error::Parse, got {error:?}");
  }

  #[test]
  fn status_response_with_non_numeric_value_is_parse_error() {
    let mut transport = NullTransport;
    let error = parse_line(b"* STATUS \"foo\" (MESSAGES many)\r\n".to_vec(), &mut transport).unwrap_err();
    assert!(matches!(error, Error::Parse { .. }), "expected Error::Parse, got {error:?}");
  }

  #[test]
  fn nil_vs_empty_string_vs_empty_list_distinctness() {
    let ParsedLine::Response(response) = parse(
      b"* 1 FETCH (ENVELOPE (NIL \"\" (NIL NIL NIL NIL) NIL () NIL NIL NIL NIL))\r\n",
    ) else {
      panic!("expected a response");
    };
    let Data::Fetch { attributes, .. } = response.data else {
      panic!("expected FETCH data");
    };
    let (_, FetchValue::Envelope(envelope)) = &attributes[0] else {
      panic!("expected an ENVELOPE attribute");
    };
    // date is NIL: absent, not merely zero.
    assert_eq!(Nillable::Nil, envelope.date);
    // subject is the empty string: present, distinct from NIL.
    assert_eq!(Nillable::Present(b"".to_vec()), envelope.subject);
    // from has one address whose display-name is NIL, not "".
    assert_eq!(1, envelope.from.len());
    assert_eq!(Nillable::Nil, envelope.from[0].display_name);
    // sender is an empty parenthesised list: present but zero addresses,
    // same outward shape as reply_to being NIL outright (both decode to
    // the empty Vec), since RFC 3501 gives no field where that particular
    // distinction carries meaning.
    assert_eq!(Vec::<Address>::new(), envelope.sender);
    assert_eq!(Vec::<Address>::new(), envelope.reply_to);
  }

  #[test]
  fn fetch_key_spanning_brackets() {
    let ParsedLine::Response(response) = parse(
      b"* 12 FETCH (BODY[HEADER.FIELDS (FROM DATE)] \"from and date\")\r\n",
    ) else {
      panic!("expected a response");
    };
    let Data::Fetch { index, attributes } = response.data else {
      panic!("expected FETCH data");
    };
    assert_eq!(12, index);
    assert_eq!(1, attributes.len());
    assert_eq!(b"BODY[HEADER.FIELDS (FROM DATE)]", attributes[0].0.as_slice());
  }

  #[test]
  fn tagged_status_response() {
    let ParsedLine::Response(response) = parse(b"ym1 OK LOGIN completed\r\n") else {
      panic!("expected a response");
    };
    assert_eq!(Tag::Tagged("ym1".to_string()), response.tag);
    assert_eq!(Kind::Ok, response.kind);
  }

  #[test]
  fn continuation_request() {
    assert_eq!(
      ParsedLine::Continuation(b"".to_vec()),
      parse(b"+ \r\n")
    );
  }

  #[test]
  fn quoted_escape_round_trips_unknown_escape() {
    let ParsedLine::Response(response) = parse(b"* 1 FETCH (BODY[] \"a\\x\")\r\n") else {
      panic!("expected a response");
    };
    let Data::Fetch { attributes, .. } = response.data else {
      panic!("expected FETCH data");
    };
    assert_eq!(
      FetchValue::Raw(RawValue::Str(br#"a\x"#.to_vec())),
      attributes[0].1
    );
  }
}
