//! RFC 2347/2348/2349 option negotiation: `blksize`, `timeout`, `tsize`.
//!
//! An [`Options`] value models the options a peer asked for (or, on the
//! reply side, the subset the local end accepted). Parsing never fails: an
//! out-of-range or unrecognized option is simply absent from the result, so
//! it is silently omitted from the OACK rather than rejected outright, per
//! spec §3.

use bytes::{BufMut, Bytes, BytesMut};
use std::path::Path;

pub const MIN_BLKSIZE: u16 = 8;
pub const MAX_BLKSIZE: u16 = 65464;
pub const DEFAULT_BLKSIZE: u16 = 512;
pub const DEFAULT_TIMEOUT: u8 = 5;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Options {
    blksize: Option<u16>,
    timeout: Option<u8>,
    tsize: Option<u64>,
}

impl Options {
    pub fn blksize(&self) -> usize {
        self.blksize.unwrap_or(DEFAULT_BLKSIZE) as usize
    }

    pub fn timeout(&self) -> u64 {
        self.timeout.unwrap_or(DEFAULT_TIMEOUT) as u64
    }

    pub fn tsize(&self) -> u64 {
        self.tsize.unwrap_or(0)
    }

    pub fn blksize_requested(&self) -> Option<u16> {
        self.blksize
    }

    pub fn timeout_requested(&self) -> Option<u8> {
        self.timeout
    }

    pub fn tsize_requested(&self) -> Option<u64> {
        self.tsize
    }

    pub fn as_bytes(&self) -> Bytes {
        let mut bytes = BytesMut::new();

        if let Some(blksize) = self.blksize {
            bytes.put("blksize".as_bytes());
            bytes.put_u8(0);
            bytes.put(blksize.to_string().as_bytes());
            bytes.put_u8(0);
        }

        if let Some(timeout) = self.timeout {
            bytes.put("timeout".as_bytes());
            bytes.put_u8(0);
            bytes.put(timeout.to_string().as_bytes());
            bytes.put_u8(0);
        }

        if let Some(tsize) = self.tsize {
            bytes.put("tsize".as_bytes());
            bytes.put_u8(0);
            bytes.put(tsize.to_string().as_bytes());
            bytes.put_u8(0);
        }

        bytes.freeze()
    }

    /// Narrows `self` (the requester's options) down to what the local end
    /// is willing to offer, given `limits`. `blksize` may only shrink, never
    /// grow — a responder MAY offer a smaller payload than requested but
    /// never a larger one (spec §4.2).
    pub fn negotiate(&self, limits: &Options) -> Options {
        let mut out = self.clone();

        if let Some(blksize) = out.blksize {
            out.blksize = match limits.blksize {
                Some(limit) if limit < blksize => Some(limit),
                _ => Some(blksize),
            };
        }

        if limits.timeout.is_none() {
            out.timeout = None;
        }

        if limits.tsize.is_none() {
            out.tsize = None;
        }

        out
    }

    pub fn has_option(&self) -> bool {
        self.blksize.is_some() || self.timeout.is_some() || self.tsize.is_some()
    }

    /// Sets `tsize` to the file's actual size, if the peer asked for tsize
    /// at all (requesting `tsize=0` is how a reader announces interest).
    pub fn set_tsize(&mut self, filepath: &Path) -> std::io::Result<()> {
        if self.tsize.is_some() {
            self.tsize = Some(filepath.metadata()?.len());
        }
        Ok(())
    }

    /// True if `reply` mentions an option name that `self` (the original
    /// request) never asked for — an unsolicited OACK entry, which per
    /// spec §4.2 must be answered with ERROR(8).
    pub fn has_unsolicited(&self, reply: &Options) -> bool {
        (reply.blksize.is_some() && self.blksize.is_none())
            || (reply.timeout.is_some() && self.timeout.is_none())
            || (reply.tsize.is_some() && self.tsize.is_none())
    }

    /// True if `reply` raises blksize above what `self` requested — also an
    /// OptionNegotiationFailed condition (a responder may only shrink it).
    pub fn increases_blksize(&self, reply: &Options) -> bool {
        match (self.blksize, reply.blksize) {
            (Some(requested), Some(replied)) => replied > requested,
            _ => false,
        }
    }
}

impl Options {
    /// Best-effort parse of a sequence of NUL-terminated name/value pairs.
    /// Unrecognized or out-of-range entries are simply absent from the
    /// result. Callers that must distinguish "absent" from "malformed" (the
    /// codec, per spec §4.1) validate field structure themselves before
    /// calling this.
    pub fn parse(mut buf: &[u8]) -> Options {
        let mut options = Options::default();

        while let Some(key_end) = buf.iter().position(|&b| b == 0) {
            let key = &buf[..key_end];
            buf = &buf[key_end + 1..];

            let Some(value_end) = buf.iter().position(|&b| b == 0) else {
                break;
            };
            let value = &buf[..value_end];
            buf = &buf[value_end + 1..];

            let k = String::from_utf8_lossy(key);
            let v = String::from_utf8_lossy(value);

            match k.to_lowercase().as_str() {
                "blksize" => {
                    if let Ok(blksize) = v.parse::<u16>() {
                        if (MIN_BLKSIZE..=MAX_BLKSIZE).contains(&blksize) {
                            options.blksize = Some(blksize);
                        }
                    }
                }
                "timeout" => {
                    if let Ok(timeout) = v.parse::<u8>() {
                        if timeout >= 1 {
                            options.timeout = Some(timeout);
                        }
                    }
                }
                "tsize" => {
                    if let Ok(tsize) = v.parse::<u64>() {
                        options.tsize = Some(tsize);
                    }
                }
                _ => {}
            }
        }

        options
    }
}

#[derive(Default, Clone)]
pub struct OptionBuilder {
    options: Options,
}

impl OptionBuilder {
    pub fn blksize(self, blksize: u16) -> Self {
        OptionBuilder {
            options: Options {
                blksize: Some(blksize),
                ..self.options
            },
        }
    }

    pub fn timeout(self, timeout: u8) -> Self {
        OptionBuilder {
            options: Options {
                timeout: Some(timeout),
                ..self.options
            },
        }
    }

    pub fn tsize(self) -> Self {
        OptionBuilder {
            options: Options {
                tsize: Some(0),
                ..self.options
            },
        }
    }

    pub fn build(self) -> Options {
        self.options
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_in_range_blksize() {
        let opts = Options::parse(b"blksize\x001024\x00");
        assert_eq!(1024, opts.blksize());
    }

    #[test]
    fn drops_out_of_range_blksize() {
        let opts = Options::parse(b"blksize\x0070000\x00");
        assert_eq!(DEFAULT_BLKSIZE as usize, opts.blksize());
        assert!(!opts.has_option());
    }

    #[test]
    fn negotiate_only_shrinks_blksize() {
        let requested = OptionBuilder::default().blksize(4096).build();
        let limits = OptionBuilder::default().blksize(1024).build();
        let accepted = requested.negotiate(&limits);
        assert_eq!(1024, accepted.blksize());

        let limits_larger = OptionBuilder::default().blksize(8192).build();
        let accepted2 = requested.negotiate(&limits_larger);
        assert_eq!(4096, accepted2.blksize());
    }

    #[test]
    fn detects_unsolicited_option() {
        let requested = OptionBuilder::default().blksize(1024).build();
        let reply = OptionBuilder::default().blksize(1024).timeout(3).build();
        assert!(requested.has_unsolicited(&reply));
    }

    #[test]
    fn detects_blksize_increase() {
        let requested = OptionBuilder::default().blksize(512).build();
        let reply = OptionBuilder::default().blksize(4096).build();
        assert!(requested.increases_blksize(&reply));
    }
}
