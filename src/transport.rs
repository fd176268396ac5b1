//! The byte-stream transport the engine drives. Concrete transports are
//! external collaborators (plain TCP, TLS-upgraded socket, a child-process
//! pipe); the engine only ever sees the `Transport` trait.
//!
//! Grounded on `TCP`/`TLS`/`TLSStream` — the teacher's own `sync::Open`
//! implementations — generalized behind a trait so `wait_readable` and
//! `upgrade_tls` have somewhere to live (the teacher never needed either
//! because its `Stream<RW>` only ever drove a single blocking read loop
//! with no poll/IDLE interleaving).

use anyhow::Context as _;
use std::{
  io::{self, Read as _, Write as _},
  net, time,
};

/// A closed set of transport capabilities. There is no default
/// "unimplemented" method bound at runtime (the Python original's
/// `__todo` sentinel pattern) — a transport that can't do TLS simply
/// doesn't implement `upgrade_tls` successfully, it returns `false`.
pub trait Transport {
  /// Reads one CRLF-terminated line, CRLF included.
  fn read_line(&mut self) -> anyhow::Result<Vec<u8>>;
  /// Reads exactly `n` octets.
  fn read_exact(&mut self, n: usize) -> anyhow::Result<Vec<u8>>;
  fn write(&mut self, octets: &[u8]) -> anyhow::Result<()>;
  fn flush(&mut self) -> anyhow::Result<()>;
  /// Polls for readability with a bounded wait. `None` means "forever".
  fn wait_readable(&mut self, timeout: Option<time::Duration>) -> anyhow::Result<bool>;
  /// Attempts an in-place TLS upgrade (STARTTLS). `false` on failure or if
  /// unsupported by this transport.
  fn upgrade_tls(&mut self) -> bool;
  fn healthy(&self) -> bool;
}

/// Buffered line/octet reader shared by every concrete transport below,
/// grounded on the teacher's `Stream::read`/`buffer` bookkeeping in
/// `source/imap.rs`, minus its NOOP-chunking hack (the engine here frames
/// every line explicitly per the lexer/response parser, so there is no
/// need to resynchronize against an opaque full-text search backend).
struct Buffered<RW> {
  rw: RW,
  buffer: Vec<u8>,
  start: usize,
  healthy: bool,
}

impl<RW> Buffered<RW>
where
  RW: io::Read + io::Write,
{
  fn new(rw: RW) -> Self {
    Self {
      rw,
      buffer: Vec::new(),
      start: 0,
      healthy: true,
    }
  }

  fn fill(&mut self) -> anyhow::Result<()> {
    let mut chunk = [0u8; 8192];
    match self.rw.read(&mut chunk) {
      Ok(0) => {
        self.healthy = false;
        anyhow::bail!("end of stream")
      }
      Ok(n) => {
        self.buffer.extend_from_slice(&chunk[..n]);
        Ok(())
      }
      Err(error) => {
        self.healthy = false;
        Err(error).context("transport read failed")
      }
    }
  }

  fn compact(&mut self) {
    if self.start > 0 {
      self.buffer.copy_within(self.start.., 0);
      self.buffer.truncate(self.buffer.len() - self.start);
      self.start = 0;
    }
  }

  fn read_line(&mut self) -> anyhow::Result<Vec<u8>> {
    loop {
      if let Some(position) = self.buffer[self.start..]
        .windows(2)
        .position(|window| window == b"\r\n")
      {
        let end = self.start + position + 2;
        let line = self.buffer[self.start..end].to_vec();
        self.start = end;
        self.compact();
        return Ok(line);
      }
      self.fill()?;
    }
  }

  fn read_exact(&mut self, n: usize) -> anyhow::Result<Vec<u8>> {
    while self.buffer.len() - self.start < n {
      self.fill()?;
    }
    let out = self.buffer[self.start..self.start + n].to_vec();
    self.start += n;
    self.compact();
    Ok(out)
  }

  fn write(&mut self, octets: &[u8]) -> anyhow::Result<()> {
    self.rw.write_all(octets).map_err(|error| {
      self.healthy = false;
      error
    })?;
    Ok(())
  }

  fn flush(&mut self) -> anyhow::Result<()> {
    self.rw.flush().map_err(Into::into)
  }
}

/// TLS stream over a `rustls::ClientConnection`, grounded on the teacher's
/// `TLSStream` (`ouroboros::self_referencing` over a `net::TcpStream` +
/// `rustls::ClientConnection`).
#[ouroboros::self_referencing]
struct TlsStream {
  tcp_stream: net::TcpStream,
  tls_connection: rustls::ClientConnection,
  #[borrows(mut tcp_stream, mut tls_connection)]
  #[covariant]
  tls_stream: rustls::Stream<'this, rustls::ClientConnection, net::TcpStream>,
}

impl io::Read for TlsStream {
  fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
    self.with_mut(|fields| fields.tls_stream.read(buf))
  }
}

impl io::Write for TlsStream {
  fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
    self.with_mut(|fields| fields.tls_stream.write(buf))
  }

  fn flush(&mut self) -> io::Result<()> {
    self.with_mut(|fields| fields.tls_stream.flush())
  }
}

fn handshake(raw: &net::TcpStream, address: &str) -> anyhow::Result<TlsStream> {
  let tcp_stream = raw.try_clone()?;

  let mut root_store = rustls::RootCertStore::empty();
  for certificate in rustls_native_certs::load_native_certs()? {
    root_store.add(&rustls::Certificate(certificate.0))?;
  }
  let tls_connection = rustls::ClientConnection::new(
    std::sync::Arc::new(
      rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(root_store)
        .with_no_client_auth(),
    ),
    address
      .try_into()
      .with_context(|| format!("couldn't convert {address} to server name"))?,
  )?;

  Ok(
    TlsStreamBuilder {
      tcp_stream,
      tls_connection,
      tls_stream_builder: |tcp_stream, tls_connection| rustls::Stream::new(tls_connection, tcp_stream),
    }
    .build(),
  )
}

/// Either side of an in-place STARTTLS upgrade. Both variants share the
/// same `Buffered` plumbing; only the underlying `io::Read + io::Write`
/// changes.
enum Body {
  Plain(Buffered<net::TcpStream>),
  Tls(Buffered<TlsStream>),
}

/// TCP transport that can upgrade itself to TLS in place, grounded on the
/// teacher's `TCP`/`TLSStream`/`sync::Open`, generalized so STARTTLS is a
/// real state transition rather than a reconnect through a distinct type.
pub struct TcpTransport {
  body: Body,
  /// Kept for `wait_readable`'s `peek` and for the STARTTLS handshake,
  /// which both need a raw socket independent of whichever `Buffered`
  /// wraps it.
  raw: net::TcpStream,
  address: String,
}

impl TcpTransport {
  pub fn connect(address: &str, port: u16, timeout: Option<time::Duration>) -> anyhow::Result<Self> {
    use std::net::ToSocketAddrs as _;
    let resolved = (address, port)
      .to_socket_addrs()?
      .next()
      .with_context(|| format!("couldn't resolve {address}:{port}"))?;
    log::debug!("connecting to {resolved:?} with timeout {timeout:?}");
    let stream = match timeout {
      Some(duration) => {
        let stream = net::TcpStream::connect_timeout(&resolved, duration)?;
        stream.set_read_timeout(Some(duration))?;
        stream
      }
      None => net::TcpStream::connect(resolved)?,
    };
    stream.set_nodelay(true)?;
    Ok(Self {
      body: Body::Plain(Buffered::new(stream.try_clone()?)),
      raw: stream,
      address: address.to_owned(),
    })
  }

  /// Connects and immediately negotiates TLS, for servers that expect TLS
  /// from the first octet (IMAPS on port 993) rather than STARTTLS.
  pub fn connect_tls(address: &str, port: u16, timeout: Option<time::Duration>) -> anyhow::Result<Self> {
    let mut transport = Self::connect(address, port, timeout)?;
    anyhow::ensure!(transport.upgrade_tls(), "TLS handshake failed");
    Ok(transport)
  }
}

impl Transport for TcpTransport {
  fn read_line(&mut self) -> anyhow::Result<Vec<u8>> {
    match &mut self.body {
      Body::Plain(buffered) => buffered.read_line(),
      Body::Tls(buffered) => buffered.read_line(),
    }
  }

  fn read_exact(&mut self, n: usize) -> anyhow::Result<Vec<u8>> {
    match &mut self.body {
      Body::Plain(buffered) => buffered.read_exact(n),
      Body::Tls(buffered) => buffered.read_exact(n),
    }
  }

  fn write(&mut self, octets: &[u8]) -> anyhow::Result<()> {
    match &mut self.body {
      Body::Plain(buffered) => buffered.write(octets),
      Body::Tls(buffered) => buffered.write(octets),
    }
  }

  fn flush(&mut self) -> anyhow::Result<()> {
    match &mut self.body {
      Body::Plain(buffered) => buffered.flush(),
      Body::Tls(buffered) => buffered.flush(),
    }
  }

  fn wait_readable(&mut self, timeout: Option<time::Duration>) -> anyhow::Result<bool> {
    let buffered_pending = match &self.body {
      Body::Plain(buffered) => !buffered.buffer[buffered.start..].is_empty(),
      Body::Tls(buffered) => !buffered.buffer[buffered.start..].is_empty(),
    };
    if buffered_pending {
      return Ok(true);
    }
    self.raw.set_read_timeout(timeout)?;
    let mut probe = [0u8; 1];
    match self.raw.peek(&mut probe) {
      Ok(_) => Ok(true),
      Err(error) if matches!(error.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
        Ok(false)
      }
      Err(error) => Err(error.into()),
    }
  }

  fn upgrade_tls(&mut self) -> bool {
    if matches!(self.body, Body::Tls(_)) {
      // A second upgrade is a protocol error on the caller's part, not a
      // transport fault; refuse rather than re-handshake.
      return false;
    }
    match handshake(&self.raw, &self.address) {
      Ok(stream) => {
        self.body = Body::Tls(Buffered::new(stream));
        true
      }
      Err(error) => {
        log::warn!("STARTTLS handshake with {} failed: {error:#}", self.address);
        false
      }
    }
  }

  fn healthy(&self) -> bool {
    match &self.body {
      Body::Plain(buffered) => buffered.healthy,
      Body::Tls(buffered) => buffered.healthy,
    }
  }
}
