//! Sentence reformatting: NMEA 4.10 tag blocks and stream framing.

use tracing::warn;

use crate::packet::Packet;

/// Stamps every message of `packet` with a tag block carrying its provenance.
///
/// Each returned line is newline-terminated. Messages that are not valid UTF-8 or
/// whose existing tag block cannot be decoded are passed through unmodified.
pub fn tag_messages(packet: &Packet) -> Vec<Vec<u8>> {
    let timestamp = packet.timestamp().timestamp();
    packet
        .messages()
        .iter()
        .map(|message| {
            let line = match std::str::from_utf8(message) {
                Ok(text) => annotate(text, packet.source_name(), timestamp, packet.source_host())
                    .unwrap_or_else(|| text.to_string())
                    .into_bytes(),
                Err(_) => message.clone(),
            };
            [line.as_slice(), b"\n"].concat()
        })
        .collect()
}

/// Sets `t` to the provider name and fills in `c` and `s` when missing.
///
/// Returns `None` when the line already has a tag block that cannot be decoded.
pub fn annotate(line: &str, source: &str, timestamp: i64, station: &str) -> Option<String> {
    let (tagblock, sentence) = split_tagblock(line);
    let mut fields = match tagblock {
        Some(tagblock) => decode_tagblock(tagblock)?,
        None => Vec::new(),
    };

    if !fields.iter().any(|(key, _)| key == "c") {
        fields.push(("c".to_string(), timestamp.to_string()));
    }
    if !fields.iter().any(|(key, _)| key == "s") {
        fields.push(("s".to_string(), station.to_string()));
    }
    match fields.iter_mut().find(|(key, _)| key == "t") {
        Some((_, text)) => *text = source.to_string(),
        None => fields.push(("t".to_string(), source.to_string())),
    }

    Some(format!("{}{sentence}", encode_tagblock(&fields)))
}

/// Splits `\<tagblock>\<sentence>` into its parts. Lines without a tag block are all sentence.
pub fn split_tagblock(line: &str) -> (Option<&str>, &str) {
    let Some(rest) = line.strip_prefix('\\') else {
        return (None, line);
    };
    match rest.find('\\') {
        Some(end) => (Some(&rest[..end]), &rest[end + 1..]),
        None => (None, line),
    }
}

/// Decodes `k:v,k:v*HH`. The checksum is verified when present.
pub fn decode_tagblock(tagblock: &str) -> Option<Vec<(String, String)>> {
    let body = match tagblock.rsplit_once('*') {
        Some((body, checksum)) => {
            let expected = u8::from_str_radix(checksum, 16).ok()?;
            if checksum.len() != 2 || nmea_checksum(body) != expected {
                return None;
            }
            body
        }
        None => tagblock,
    };

    if body.is_empty() {
        return Some(Vec::new());
    }

    body.split(',')
        .map(|field| {
            let (key, value) = field.split_once(':')?;
            (!key.is_empty()).then(|| (key.to_string(), value.to_string()))
        })
        .collect()
}

pub fn encode_tagblock(fields: &[(String, String)]) -> String {
    let body = fields
        .iter()
        .map(|(key, value)| format!("{key}:{value}"))
        .collect::<Vec<_>>()
        .join(",");
    format!("\\{body}*{:02X}\\", nmea_checksum(&body))
}

/// XOR of all bytes, as used by NMEA sentences and tag blocks.
pub fn nmea_checksum(data: &str) -> u8 {
    data.bytes().fold(0, |acc, b| acc ^ b)
}

/// Accumulates stream reads and releases only complete, delimiter-terminated data.
pub struct LineFramer {
    buf: Box<[u8]>,
    filled: usize,
    delimiter: Vec<u8>,
}

impl LineFramer {
    pub fn new(capacity: usize, delimiter: &str) -> Self {
        LineFramer {
            buf: vec![0u8; capacity.max(1)].into_boxed_slice(),
            filled: 0,
            delimiter: delimiter.as_bytes().to_vec(),
        }
    }

    /// Space for the next read.
    pub fn free_space(&mut self) -> &mut [u8] {
        &mut self.buf[self.filled..]
    }

    /// Accounts for `bytes_read` new bytes and returns everything up to the last delimiter.
    ///
    /// When the buffer is full and holds no delimiter at all, the whole buffer is
    /// returned so the stream keeps moving.
    pub fn commit(&mut self, bytes_read: usize) -> Option<Vec<u8>> {
        self.filled += bytes_read;
        let valid_part = &self.buf[..self.filled];

        let boundary = if self.delimiter.is_empty() {
            Some(valid_part.len())
        } else {
            valid_part
                .windows(self.delimiter.len())
                .rposition(|w| w == self.delimiter.as_slice())
                .map(|idx| idx + self.delimiter.len())
        };

        match boundary {
            Some(end) => {
                let completed_part = valid_part[..end].to_vec();
                self.buf.copy_within(end..self.filled, 0);
                self.filled -= end;
                Some(completed_part)
            }
            None if self.filled == self.buf.len() => {
                warn!(
                    "receive buffer of {} bytes full without a delimiter, flushing it",
                    self.buf.len()
                );
                self.flush()
            }
            None => None,
        }
    }

    /// Takes whatever is buffered, complete or not.
    pub fn flush(&mut self) -> Option<Vec<u8>> {
        if self.filled == 0 {
            return None;
        }
        let data = self.buf[..self.filled].to_vec();
        self.filled = 0;
        Some(data)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::packet::Protocol;

    #[test]
    fn test_annotate_without_tagblock() {
        let line = annotate("!AIVDM,1,1,,A,x,0*00", "spire", 1700000000, "10.0.0.1").unwrap();
        let (tagblock, sentence) = split_tagblock(&line);

        assert_eq!(sentence, "!AIVDM,1,1,,A,x,0*00");
        assert_eq!(
            decode_tagblock(tagblock.unwrap()).unwrap(),
            vec![
                ("c".to_string(), "1700000000".to_string()),
                ("s".to_string(), "10.0.0.1".to_string()),
                ("t".to_string(), "spire".to_string()),
            ]
        );
    }

    #[test]
    fn test_annotate_keeps_existing_fields() {
        let existing = encode_tagblock(&[
            ("s".to_string(), "rMT9999".to_string()),
            ("c".to_string(), "1749945745".to_string()),
            ("t".to_string(), "old".to_string()),
        ]);
        let line = format!("{existing}!AIVDM,1,1,,A,x,0*00");

        let annotated = annotate(&line, "orbcomm", 1, "10.0.0.1").unwrap();
        let (tagblock, _) = split_tagblock(&annotated);

        assert_eq!(
            decode_tagblock(tagblock.unwrap()).unwrap(),
            vec![
                ("s".to_string(), "rMT9999".to_string()),
                ("c".to_string(), "1749945745".to_string()),
                ("t".to_string(), "orbcomm".to_string()),
            ]
        );
    }

    #[rstest]
    #[case::bad_checksum(r"\c:1*00\!AIVDM,1,1,,A,x,0")]
    #[case::field_without_colon(r"\c1\!AIVDM,1,1,,A,x,0")]
    fn test_undecodable_tagblock_passes_through(#[case] line: &str) {
        assert_eq!(annotate(line, "src", 1, "host"), None);
    }

    #[test]
    fn test_checksum_matches_known_tagblock() {
        // Tag block as transmitted by a live feed.
        assert_eq!(nmea_checksum("s:rMT7892,t:marinetraffic,c:1749945745"), 0x45);
    }

    #[test]
    fn test_tag_messages() {
        let data = b"!AIVDM,1,1,,A,x,0\n\n!AIVDM,1,1,,B,y,0";
        let packet = Packet::new(&data[..], Protocol::Udp, "1.2.3.4").with_source_name("feed");
        let lines = tag_messages(&packet);

        assert_eq!(lines.len(), 2);
        for line in &lines {
            let text = std::str::from_utf8(line).unwrap();
            assert!(text.ends_with('\n'));
            assert!(text.contains("t:feed"));
            assert!(text.contains("s:1.2.3.4"));
        }
    }

    #[test]
    fn test_framer_holds_back_incomplete_tail() {
        let mut framer = LineFramer::new(64, "\n");

        let input = b"!AIVDM,a\n!AIVDM,b\n!AIV";
        framer.free_space()[..input.len()].copy_from_slice(input);
        assert_eq!(framer.commit(input.len()).unwrap(), b"!AIVDM,a\n!AIVDM,b\n");

        let input = b"DM,c\n";
        framer.free_space()[..input.len()].copy_from_slice(input);
        assert_eq!(framer.commit(input.len()).unwrap(), b"!AIVDM,c\n");
        assert_eq!(framer.flush(), None);
    }

    #[test]
    fn test_framer_flushes_full_buffer() {
        let mut framer = LineFramer::new(4, "\n");
        framer.free_space().copy_from_slice(b"abcd");
        assert_eq!(framer.commit(4).unwrap(), b"abcd");
        assert_eq!(framer.free_space().len(), 4);
    }

    #[test]
    fn test_framer_waits_for_delimiter() {
        let mut framer = LineFramer::new(16, "\r\n");
        framer.free_space()[..3].copy_from_slice(b"abc");
        assert_eq!(framer.commit(3), None);
        assert_eq!(framer.flush().unwrap(), b"abc");
    }
}
