//! Modified UTF-7 mailbox-name encoding (RFC 3501 §5.1.3 / RFC 2152).
//!
//! Kept as a convenience re-export even though name encoding is nominally
//! an external collaborator (see `lib.rs`): it is a small, self-contained,
//! already-well-tested pure function with no bearing on the engine's
//! state machine.

use base64::Engine as _;

fn mutf7_engine() -> base64::engine::GeneralPurpose {
  base64::engine::GeneralPurpose::new(
    &base64::alphabet::IMAP_MUTF7,
    base64::engine::general_purpose::NO_PAD,
  )
}

pub fn utf7_to_utf8(input: &[u8]) -> Option<String> {
  let engine = mutf7_engine();
  let mut buffer = Vec::new();
  let mut output = String::new();
  let mut i = 0;
  while i < input.len() {
    match input[i] {
      // "&" is used to shift to modified BASE64 and "-" to shift back to
      // US-ASCII.
      b'&' => {
        let start = i;
        loop {
          i += 1;
          if i == input.len() {
            return None;
          }
          if input[i] == b'-' {
            break;
          }
        }
        if start + 1 == i {
          // "&" (0x26) is represented by the two-octet sequence "&-".
          output.push('&');
        } else {
          buffer.truncate(0);
          buffer
            .try_reserve(base64::decoded_len_estimate(i - (start + 1)))
            .ok()?;
          engine.decode_vec(&input[start + 1..i], &mut buffer).ok()?;

          let utf16: Vec<u16> = buffer
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect();
          if buffer.len() % 2 != 0 {
            return None;
          }
          output.push_str(&String::from_utf16(&utf16).ok()?);
        }
      }
      // Printable US-ASCII characters, except "&", represent themselves.
      c @ 0x20..=0x25 | c @ 0x27..=0x7e => output.push(c as char),
      _ => return None,
    }
    i += 1;
  }
  Some(output)
}

pub fn utf8_to_utf7(input: &str) -> String {
  let engine = mutf7_engine();
  let mut output = String::new();
  let mut shifted: Vec<u16> = Vec::new();

  let flush = |shifted: &mut Vec<u16>, output: &mut String| {
    if shifted.is_empty() {
      return;
    }
    let mut bytes = Vec::with_capacity(shifted.len() * 2);
    for unit in shifted.drain(..) {
      bytes.extend_from_slice(&unit.to_be_bytes());
    }
    output.push('&');
    output.push_str(&engine.encode(bytes));
    output.push('-');
  };

  for c in input.chars() {
    match c {
      '&' if shifted.is_empty() => output.push_str("&-"),
      c @ '\u{20}'..='\u{25}' | c @ '\u{27}'..='\u{7e}' => {
        flush(&mut shifted, &mut output);
        output.push(c);
      }
      c => {
        let mut units = [0u16; 2];
        for unit in c.encode_utf16(&mut units) {
          shifted.push(*unit);
        }
      }
    }
  }
  flush(&mut shifted, &mut output);
  output
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn decode() {
    assert_eq!("", utf7_to_utf8(b"").unwrap());
    assert_eq!("&", utf7_to_utf8(b"&-").unwrap());
    assert_eq!(
      "~peter/mail/台北/日本語",
      utf7_to_utf8(b"~peter/mail/&U,BTFw-/&ZeVnLIqe-").unwrap()
    );
    assert_eq!(None, utf7_to_utf8(b"&Jjo!"));
    assert_eq!("☺!", utf7_to_utf8(b"&Jjo-!").unwrap());
    assert_eq!("台北日本語", utf7_to_utf8(b"&U,BTFw-&ZeVnLIqe-").unwrap());
    assert_eq!("台北日本語", utf7_to_utf8(b"&U,BTF2XlZyyKng-").unwrap())
  }

  #[test]
  fn roundtrip() {
    for sample in ["", "&", "INBOX", "台北/日本語", "a&b"] {
      let encoded = utf8_to_utf7(sample);
      assert_eq!(sample, utf7_to_utf8(encoded.as_bytes()).unwrap());
    }
  }
}
