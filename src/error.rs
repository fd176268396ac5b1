/// Fault kinds the engine can raise. `ContinuationRequest` is not one of
/// them: a `+` line is an ordinary event (see `response::Parsed`), never an
/// error, per the engine's continuation-as-event design.
#[derive(thiserror::Error, Debug)]
pub enum Error {
  #[error("parse error at {context}")]
  Parse { context: String },
  #[error("unknown response: {0}")]
  UnknownResponse(String),
  #[error("invalid response: {0}")]
  InvalidResponse(String),
  #[error("timed out waiting for data")]
  Timeout,
  #[error("engine is disconnected")]
  Disconnected,
  #[error(transparent)]
  Transport(#[from] anyhow::Error),
}

impl Error {
  pub fn parse(context: impl Into<String>) -> Self {
    Self::Parse {
      context: context.into(),
    }
  }

  /// Whether this fault poisons the owning engine, per the error-handling
  /// design: timeouts are only fatal mid-frame, everything else parse- or
  /// transport-shaped always is.
  pub fn is_fatal(&self) -> bool {
    !matches!(self, Self::Timeout)
  }
}

/// Line summaries used in error contexts and trace logs; mirrors the
/// teacher's own `escape`/`summarize` helpers in `imap.rs`.
pub(crate) fn escape(bytes: &[u8]) -> String {
  let mut string = String::new();
  for byte in bytes {
    string += &std::ascii::escape_default(*byte).to_string();
  }
  string
}

/// Truncates to the first CRLF-terminated line before escaping, same as
/// the teacher's `summarize`, so a literal's payload never floods the log.
pub(crate) fn summarize(bytes: &[u8]) -> String {
  let stop = bytes
    .windows(2)
    .position(|window| window == b"\r\n")
    .unwrap_or(bytes.len());
  let stop = std::cmp::min(stop + 2, bytes.len());
  let mut string = escape(&bytes[..stop]);
  if stop < bytes.len() {
    string += "...omitted...";
  }
  string
}
