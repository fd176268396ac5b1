//! Worker-binding ordering guarantees that need two real threads to
//! observe (§5 "Ordering": untagged responses belonging to a command
//! precede its tagged completion in the outbound queue; §8 property 4:
//! tags are strictly increasing by 1 in enqueue order).

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use pretty_assertions::assert_eq;
use test_log::test;
use ymap::{Client, Tag, Transport};

struct LoopbackTransport {
  inbound: Arc<Mutex<VecDeque<Vec<u8>>>>,
  written: Arc<Mutex<Vec<u8>>>,
}

impl Transport for LoopbackTransport {
  fn read_line(&mut self) -> anyhow::Result<Vec<u8>> {
    loop {
      if let Some(line) = self.inbound.lock().unwrap().pop_front() {
        return Ok(line);
      }
      thread::sleep(Duration::from_millis(5));
    }
  }

  fn read_exact(&mut self, _n: usize) -> anyhow::Result<Vec<u8>> {
    anyhow::bail!("not exercised by this test")
  }

  fn write(&mut self, octets: &[u8]) -> anyhow::Result<()> {
    self.written.lock().unwrap().extend_from_slice(octets);
    Ok(())
  }

  fn flush(&mut self) -> anyhow::Result<()> {
    Ok(())
  }

  fn wait_readable(&mut self, _timeout: Option<Duration>) -> anyhow::Result<bool> {
    Ok(!self.inbound.lock().unwrap().is_empty())
  }

  fn upgrade_tls(&mut self) -> bool {
    false
  }

  fn healthy(&self) -> bool {
    true
  }
}

fn push(inbound: &Arc<Mutex<VecDeque<Vec<u8>>>>, line: &[u8]) {
  inbound.lock().unwrap().push_back(line.to_vec());
}

#[test]
fn untagged_responses_precede_their_commands_tagged_completion() {
  let inbound = Arc::new(Mutex::new(VecDeque::new()));
  let written = Arc::new(Mutex::new(Vec::new()));
  let transport = LoopbackTransport {
    inbound: Arc::clone(&inbound),
    written: Arc::clone(&written),
  };
  let client = Client::connect(transport, HashSet::new());

  let tag = client.cmd_select("INBOX").unwrap();
  assert_eq!("ym1", tag);

  push(&inbound, b"* 172 EXISTS\r\n");
  push(&inbound, b"* 1 RECENT\r\n");
  push(&inbound, b"* OK [UIDVALIDITY 3857529045] UIDs valid\r\n");
  push(&inbound, format!("{tag} OK [READ-WRITE] SELECT completed\r\n").as_bytes());

  let mut kinds = Vec::new();
  loop {
    let response = client.get_timeout(Duration::from_secs(5)).unwrap();
    let is_final = response.tag == Tag::Tagged(tag.clone());
    kinds.push((response.tag.clone(), response.kind));
    if is_final {
      break;
    }
  }

  assert_eq!(4, kinds.len());
  assert!(kinds[..3].iter().all(|(tag, _)| *tag == Tag::Untagged));
  assert_eq!(Tag::Tagged(tag), kinds[3].0);

  assert!(client.stop().is_empty());
}

#[test]
fn tags_allocated_by_a_single_client_are_strictly_increasing() {
  let inbound = Arc::new(Mutex::new(VecDeque::new()));
  let written = Arc::new(Mutex::new(Vec::new()));
  let transport = LoopbackTransport {
    inbound: Arc::clone(&inbound),
    written: Arc::clone(&written),
  };
  let client = Client::connect(transport, HashSet::new());

  let tags: Vec<String> = (0..5).map(|_| client.cmd_noop().unwrap()).collect();
  let numbers: Vec<u64> = tags
    .iter()
    .map(|tag| tag.strip_prefix("ym").unwrap().parse().unwrap())
    .collect();

  for window in numbers.windows(2) {
    assert_eq!(window[1], window[0] + 1);
  }

  assert!(client.stop().len() <= 5);
}
