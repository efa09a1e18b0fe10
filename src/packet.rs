//! Wire codec for the five TFTP packet types plus OACK (spec §4.1).
//!
//! `encode`/`decode` are pure: no I/O, no session state. `decode` rejects
//! anything that does not parse to a complete packet rather than guessing —
//! callers turn a [`Error::MalformedPacket`] into a wire ERROR(4) if they
//! know who to send it to.

use super::error::Error;
use super::options::Options;
use super::OpCode;
use bytes::{BufMut, Bytes, BytesMut};

pub const MODES: [&str; 3] = ["netascii", "octet", "mail"];

#[derive(Clone, Debug, PartialEq)]
pub enum Packet {
    Rrq {
        filename: String,
        mode: String,
        options: Options,
    },
    Wrq {
        filename: String,
        mode: String,
        options: Options,
    },
    Data {
        block: u16,
        payload: Bytes,
    },
    Ack {
        block: u16,
    },
    Error {
        code: u16,
        message: String,
    },
    Oack {
        options: Options,
    },
}

impl Packet {
    pub fn op_code(&self) -> OpCode {
        match self {
            Packet::Rrq { .. } => OpCode::Rrq,
            Packet::Wrq { .. } => OpCode::Wrq,
            Packet::Data { .. } => OpCode::Data,
            Packet::Ack { .. } => OpCode::Ack,
            Packet::Error { .. } => OpCode::Error,
            Packet::Oack { .. } => OpCode::Oack,
        }
    }
}

/// Encodes `pkt` into its exact on-wire form (network byte order).
pub fn encode(pkt: &Packet) -> Bytes {
    let mut bytes = BytesMut::new();
    bytes.put_u16(pkt.op_code() as u16);

    match pkt {
        Packet::Rrq {
            filename,
            mode,
            options,
        }
        | Packet::Wrq {
            filename,
            mode,
            options,
        } => {
            bytes.put(filename.as_bytes());
            bytes.put_u8(0);
            bytes.put(mode.as_bytes());
            bytes.put_u8(0);
            bytes.put(options.as_bytes());
        }
        Packet::Data { block, payload } => {
            bytes.put_u16(*block);
            bytes.put(payload.clone());
        }
        Packet::Ack { block } => {
            bytes.put_u16(*block);
        }
        Packet::Error { code, message } => {
            bytes.put_u16(*code);
            bytes.put(message.as_bytes());
            bytes.put_u8(0);
        }
        Packet::Oack { options } => {
            bytes.put(options.as_bytes());
        }
    }

    bytes.freeze()
}

/// Decodes a datagram payload into a [`Packet`], per the failure conditions
/// enumerated in spec §4.1.
pub fn decode(buf: &[u8]) -> Result<Packet, Error> {
    if buf.len() < 2 {
        return Err(Error::MalformedPacket("buffer shorter than an opcode"));
    }

    let opcode = u16::from_be_bytes([buf[0], buf[1]]);
    let rest = &buf[2..];

    match opcode {
        1 => decode_request(rest, true),
        2 => decode_request(rest, false),
        3 => decode_data(rest),
        4 => decode_ack(rest),
        5 => decode_error(rest),
        6 => decode_oack(rest),
        _ => Err(Error::MalformedPacket("opcode outside 1..=6")),
    }
}

fn split_nul(buf: &[u8]) -> Option<(&[u8], &[u8])> {
    let pos = buf.iter().position(|&b| b == 0)?;
    Some((&buf[..pos], &buf[pos + 1..]))
}

/// Validates that `buf` is a sequence of NUL-terminated fields with an even
/// count (complete name/value pairs), then parses it.
fn decode_option_fields(buf: &[u8]) -> Result<Options, Error> {
    if buf.is_empty() {
        return Ok(Options::default());
    }

    let mut field_count = 0usize;
    let mut scan = buf;
    while !scan.is_empty() {
        let (_, rest) =
            split_nul(scan).ok_or(Error::MalformedPacket("option field not NUL-terminated"))?;
        field_count += 1;
        scan = rest;
    }

    if field_count % 2 != 0 {
        return Err(Error::MalformedPacket("odd number of option fields"));
    }

    Ok(Options::parse(buf))
}

fn decode_request(buf: &[u8], is_read: bool) -> Result<Packet, Error> {
    let (filename_bytes, rest) =
        split_nul(buf).ok_or(Error::MalformedPacket("missing filename terminator"))?;
    let filename = String::from_utf8(filename_bytes.to_vec())?;

    let (mode_bytes, rest) =
        split_nul(rest).ok_or(Error::MalformedPacket("missing mode terminator"))?;
    let mode = String::from_utf8(mode_bytes.to_vec())?;

    if !MODES.iter().any(|m| m.eq_ignore_ascii_case(&mode)) {
        return Err(Error::MalformedPacket("unsupported transfer mode"));
    }

    let options = decode_option_fields(rest)?;

    if is_read {
        Ok(Packet::Rrq {
            filename,
            mode,
            options,
        })
    } else {
        Ok(Packet::Wrq {
            filename,
            mode,
            options,
        })
    }
}

fn decode_data(buf: &[u8]) -> Result<Packet, Error> {
    if buf.len() < 2 {
        return Err(Error::MalformedPacket("DATA shorter than opcode+block"));
    }
    let block = u16::from_be_bytes([buf[0], buf[1]]);
    let payload = Bytes::copy_from_slice(&buf[2..]);
    Ok(Packet::Data { block, payload })
}

fn decode_ack(buf: &[u8]) -> Result<Packet, Error> {
    if buf.len() < 2 {
        return Err(Error::MalformedPacket("ACK shorter than opcode+block"));
    }
    let block = u16::from_be_bytes([buf[0], buf[1]]);
    Ok(Packet::Ack { block })
}

fn decode_error(buf: &[u8]) -> Result<Packet, Error> {
    if buf.len() < 2 {
        return Err(Error::MalformedPacket("ERROR shorter than opcode+code"));
    }
    let code = u16::from_be_bytes([buf[0], buf[1]]);
    let (message_bytes, _) =
        split_nul(&buf[2..]).ok_or(Error::MalformedPacket("ERROR message not NUL-terminated"))?;
    let message = String::from_utf8(message_bytes.to_vec())?;
    Ok(Packet::Error { code, message })
}

fn decode_oack(buf: &[u8]) -> Result<Packet, Error> {
    let options = decode_option_fields(buf)?;
    Ok(Packet::Oack { options })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::OptionBuilder;

    fn roundtrip(pkt: Packet) {
        let encoded = encode(&pkt);
        let decoded = decode(&encoded).expect("decode of freshly encoded packet");
        assert_eq!(pkt, decoded);
    }

    #[test]
    fn roundtrips_rrq() {
        roundtrip(Packet::Rrq {
            filename: "hello.txt".to_string(),
            mode: "octet".to_string(),
            options: Options::default(),
        });
    }

    #[test]
    fn roundtrips_rrq_with_options() {
        roundtrip(Packet::Rrq {
            filename: "hello.txt".to_string(),
            mode: "octet".to_string(),
            options: OptionBuilder::default().blksize(4096).tsize().build(),
        });
    }

    #[test]
    fn roundtrips_wrq() {
        roundtrip(Packet::Wrq {
            filename: "up.bin".to_string(),
            mode: "octet".to_string(),
            options: Options::default(),
        });
    }

    #[test]
    fn roundtrips_data() {
        roundtrip(Packet::Data {
            block: 1,
            payload: Bytes::from_static(b"world"),
        });
    }

    #[test]
    fn roundtrips_zero_length_data() {
        roundtrip(Packet::Data {
            block: 2,
            payload: Bytes::new(),
        });
    }

    #[test]
    fn roundtrips_ack() {
        roundtrip(Packet::Ack { block: 65535 });
    }

    #[test]
    fn roundtrips_error() {
        roundtrip(Packet::Error {
            code: 1,
            message: "File not found".to_string(),
        });
    }

    #[test]
    fn roundtrips_oack() {
        roundtrip(Packet::Oack {
            options: OptionBuilder::default().blksize(1024).timeout(3).build(),
        });
    }

    #[test]
    fn e1_download_data_packet_matches_rfc_example() {
        let pkt = Packet::Data {
            block: 1,
            payload: Bytes::from_static(b"world"),
        };
        assert_eq!(
            &[0x00, 0x03, 0x00, 0x01, b'w', b'o', b'r', b'l', b'd'][..],
            &encode(&pkt)[..]
        );
    }

    #[test]
    fn decode_rejects_short_buffer() {
        assert!(decode(&[0x00]).is_err());
        assert!(decode(&[]).is_err());
    }

    #[test]
    fn decode_rejects_unknown_opcode() {
        assert!(decode(&[0x00, 0x07]).is_err());
    }

    #[test]
    fn decode_rejects_truncated_data() {
        assert!(decode(&[0x00, 0x03, 0x00]).is_err());
    }

    #[test]
    fn decode_rejects_truncated_ack() {
        assert!(decode(&[0x00, 0x04, 0x00]).is_err());
    }

    #[test]
    fn decode_rejects_unterminated_filename() {
        let buf = [0x00, 0x01, b'a', b'b', b'c'];
        assert!(decode(&buf).is_err());
    }

    #[test]
    fn decode_rejects_unknown_mode() {
        let mut buf = vec![0x00, 0x01];
        buf.extend_from_slice(b"a\0bogus\0");
        assert!(decode(&buf).is_err());
    }

    #[test]
    fn decode_rejects_odd_option_fields() {
        let mut buf = vec![0x00, 0x01];
        buf.extend_from_slice(b"a\0octet\0blksize\0");
        assert!(decode(&buf).is_err());
    }

    #[test]
    fn decode_accepts_request_with_options() {
        let mut buf = vec![0x00, 0x01];
        buf.extend_from_slice(b"a\0octet\0blksize\x008\x00");
        let pkt = decode(&buf).unwrap();
        match pkt {
            Packet::Rrq {
                filename, options, ..
            } => {
                assert_eq!("a", filename);
                assert_eq!(8, options.blksize());
            }
            _ => panic!("expected RRQ"),
        }
    }

    #[test]
    fn decode_truncation_prefixes_are_all_malformed() {
        let full = encode(&Packet::Rrq {
            filename: "a".to_string(),
            mode: "octet".to_string(),
            options: OptionBuilder::default().blksize(8).build(),
        });

        // Testable property 2 only requires failure where a prefix breaks a
        // required field boundary. `full[..10]` is `opcode | "a\0" | "octet\0"`
        // with the option list truncated to empty, which is exactly a valid
        // option-less RRQ — a legitimately shorter packet, not a malformed
        // one — so it is excluded here rather than asserted as an error.
        let valid_boundary = 2 + "a\0".len() + "octet\0".len();
        for k in 2..full.len() {
            if k == valid_boundary {
                continue;
            }
            assert!(
                decode(&full[..k]).is_err(),
                "prefix of length {k} should be malformed"
            );
        }
    }
}
