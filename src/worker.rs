//! Threaded binding around [`Engine`]: a background thread drives
//! [`Engine::step`] in a loop, commands are submitted through an inbound
//! channel, and parsed responses come back through an outbound channel.
//!
//! Grounded on `_WorkerThread` / `start_worker` / `stop_worker` / `get` /
//! `has_responses` in `python/ymaplib/IMAPParser.py`: same daemon-thread
//! shape and same non-blocking/blocking/timeout `get()` semantics, but
//! translated onto `std::thread` and `std::sync::mpsc` since queueing and
//! threading are standard-library concerns the teacher never had to pull
//! in a crate for, and nothing in the example pack does them differently.

use std::{
  collections::HashSet,
  sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    mpsc, Arc, Mutex,
  },
  thread,
  time::Duration,
};

use crate::{
  command::{Command, Mechanism},
  engine::{Engine, Health, Pending},
  error::Error,
  response::Response,
  transport::Transport,
};

const POLL_TIMEOUT: Duration = Duration::from_millis(50);

/// A queued command plus the tag the caller will recognise its completion
/// by.
struct Outbound {
  tag: String,
  command: Command,
  mechanism: Option<Box<dyn Mechanism + Send>>,
}

/// Owns the background thread driving one connection's [`Engine`]. Dropping
/// a `Worker` stops the thread and joins it.
pub struct Worker {
  inbound_tx: mpsc::Sender<Outbound>,
  /// Shared with the worker thread so `stop` can drain whatever the
  /// thread never got to dequeue, per §4.6's "stop_worker joins and drains
  /// the inbound queue, returning its unsent items".
  inbound_rx: Arc<Mutex<mpsc::Receiver<Outbound>>>,
  outbound_rx: mpsc::Receiver<Response>,
  running: Arc<AtomicBool>,
  fault: Arc<Mutex<Option<Error>>>,
  pending: Arc<AtomicUsize>,
  /// Snapshot of the engine's observed capabilities (§6's
  /// capability-introspection accessor), refreshed by the worker thread
  /// after every `Engine::step`. A plain mutex suffices per §5: producers
  /// only ever read it, the worker thread is the sole writer.
  capabilities: Arc<Mutex<HashSet<Vec<u8>>>>,
  handle: Option<thread::JoinHandle<()>>,
}

impl Worker {
  /// Spawns the worker thread, which runs [`Engine::step`] in a loop over
  /// `transport` until `stop` is called or the connection is judged
  /// unrecoverably broken.
  pub fn start<T>(mut transport: T, mut engine: Engine) -> Self
  where
    T: Transport + Send + 'static,
  {
    let (inbound_tx, inbound_rx) = mpsc::channel::<Outbound>();
    let (outbound_tx, outbound_rx) = mpsc::channel::<Response>();
    let running = Arc::new(AtomicBool::new(true));
    let fault = Arc::new(Mutex::new(None));
    let pending = Arc::new(AtomicUsize::new(0));
    let capabilities = Arc::new(Mutex::new(HashSet::new()));
    let inbound_rx = Arc::new(Mutex::new(inbound_rx));

    let thread_running = Arc::clone(&running);
    let thread_fault = Arc::clone(&fault);
    let thread_pending = Arc::clone(&pending);
    let thread_capabilities = Arc::clone(&capabilities);
    let thread_inbound_rx = Arc::clone(&inbound_rx);
    let handle = thread::spawn(move || {
      while thread_running.load(Ordering::Acquire) {
        let dequeue = || {
          thread_inbound_rx
            .lock()
            .unwrap()
            .try_recv()
            .ok()
            .map(|outbound: Outbound| Pending {
              tag: outbound.tag,
              command: outbound.command,
              mechanism: outbound.mechanism,
            })
        };
        let publish = |response: Response| {
          thread_pending.fetch_add(1, Ordering::AcqRel);
          // The receiving end outliving the worker is the only way this
          // can fail, which only happens once `Worker` itself is gone.
          let _ = outbound_tx.send(response);
        };
        match engine.step(&mut transport, POLL_TIMEOUT, dequeue, publish) {
          Ok(()) => {
            *thread_capabilities.lock().unwrap() = engine.capabilities().clone();
            if engine.health() == Health::Broken {
              break;
            }
          }
          Err(error) => {
            *thread_fault.lock().unwrap() = Some(error);
            break;
          }
        }
      }
      thread_running.store(false, Ordering::Release);
    });

    Self {
      inbound_tx,
      inbound_rx,
      outbound_rx,
      running,
      fault,
      pending,
      capabilities,
      handle: Some(handle),
    }
  }

  /// Submits a command for the worker to dispatch; returns the tag its
  /// completion will carry.
  pub fn submit(&self, tag: String, command: Command, mechanism: Option<Box<dyn Mechanism + Send>>) -> Result<(), Error> {
    if let Some(error) = self.take_fault() {
      return Err(error);
    }
    self
      .inbound_tx
      .send(Outbound { tag, command, mechanism })
      .map_err(|_| Error::Disconnected)
  }

  /// Snapshot of the engine's effective capabilities — the
  /// capability-introspection accessor from §6, alongside the `cmd_*`
  /// entry points.
  pub fn capabilities(&self) -> HashSet<Vec<u8>> {
    self.capabilities.lock().unwrap().clone()
  }

  /// Blocks until a response is available.
  pub fn get(&self) -> Result<Response, Error> {
    match self.outbound_rx.recv() {
      Ok(response) => {
        self.pending.fetch_sub(1, Ordering::AcqRel);
        Ok(response)
      }
      Err(_) => Err(self.take_fault().unwrap_or(Error::Disconnected)),
    }
  }

  /// Blocks for at most `timeout`.
  pub fn get_timeout(&self, timeout: Duration) -> Result<Response, Error> {
    match self.outbound_rx.recv_timeout(timeout) {
      Ok(response) => {
        self.pending.fetch_sub(1, Ordering::AcqRel);
        Ok(response)
      }
      Err(mpsc::RecvTimeoutError::Timeout) => Err(Error::Timeout),
      Err(mpsc::RecvTimeoutError::Disconnected) => {
        Err(self.take_fault().unwrap_or(Error::Disconnected))
      }
    }
  }

  /// Non-blocking: `Ok(None)` if nothing has been published yet.
  pub fn try_get(&self) -> Result<Option<Response>, Error> {
    match self.outbound_rx.try_recv() {
      Ok(response) => {
        self.pending.fetch_sub(1, Ordering::AcqRel);
        Ok(Some(response))
      }
      Err(mpsc::TryRecvError::Empty) => Ok(None),
      Err(mpsc::TryRecvError::Disconnected) => {
        Err(self.take_fault().unwrap_or(Error::Disconnected))
      }
    }
  }

  /// Non-destructive check, grounded on `IMAPParser.py`'s
  /// `has_responses`/`Queue.empty`: does not consume anything.
  pub fn has_responses(&self) -> bool {
    self.pending.load(Ordering::Acquire) > 0
  }

  fn take_fault(&self) -> Option<Error> {
    self.fault.lock().unwrap().take()
  }

  /// Stops the worker thread, joins it, and drains whatever the thread
  /// never got to dequeue, returning those unsent `(tag, command)` pairs
  /// per §6 (`stop_worker() → sequence of unsent commands`). Any fault
  /// recorded before the stop is still reachable afterwards through
  /// `get`/`try_get`/`submit`.
  pub fn stop(mut self) -> Vec<(String, Command)> {
    self.running.store(false, Ordering::Release);
    if let Some(handle) = self.handle.take() {
      let _ = handle.join();
    }
    let inbound_rx = self.inbound_rx.lock().unwrap();
    let mut unsent = Vec::new();
    while let Ok(outbound) = inbound_rx.try_recv() {
      unsent.push((outbound.tag, outbound.command));
    }
    unsent
  }
}

impl Drop for Worker {
  fn drop(&mut self) {
    self.running.store(false, Ordering::Release);
    if let Some(handle) = self.handle.take() {
      let _ = handle.join();
    }
  }
}
