//! Splits a sentence stream into bounded packets.
//!
//! The multipart chunker never separates the parts of a multi-sentence AIS message:
//! a group is buffered from part 1 to its last part and then moved into the current
//! packet as a whole. `max_lines` is therefore only honored at group boundaries and a
//! group larger than the limit travels alone in its own packet.

use std::{fmt, io, str::FromStr};

use serde::Deserialize;
use tracing::warn;

use crate::error::{ChunkError, ConfigError};

pub const NMEA_PREFIXES: [&str; 8] = [
    "ABVDM", "ABVDO", "AIVDM", "AIVDO", "ANVDM", "ANVDO", "BSVDM", "BSVDO",
];

pub type ChunkResult = Result<Vec<String>, ChunkError>;

/// What to do with lines that cannot be placed in a multipart group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ChunkMode {
    /// Fail the whole stream.
    #[default]
    Strict,
    /// Log and drop the offending lines.
    Lenient,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum ChunkerKind {
    Fixed,
    #[default]
    Multipart,
}

impl FromStr for ChunkerKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fixed" => Ok(ChunkerKind::Fixed),
            "multipart" => Ok(ChunkerKind::Multipart),
            _ => Err(ConfigError::UnknownChunker(s.to_string())),
        }
    }
}

impl TryFrom<String> for ChunkerKind {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for ChunkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChunkerKind::Fixed => f.write_str("fixed"),
            ChunkerKind::Multipart => f.write_str("multipart"),
        }
    }
}

/// Anything the chunkers accept as one input line.
pub trait IntoLine {
    fn into_line(self) -> io::Result<String>;
}

impl IntoLine for String {
    fn into_line(self) -> io::Result<String> {
        Ok(self)
    }
}

impl IntoLine for &str {
    fn into_line(self) -> io::Result<String> {
        Ok(self.to_string())
    }
}

impl IntoLine for io::Result<String> {
    fn into_line(self) -> io::Result<String> {
        self
    }
}

/// Multipart header fields of one sentence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SentenceHeader<'a> {
    pub total: u32,
    pub part: u32,
    pub seq_id: &'a str,
}

/// Byte offset of the first recognized `!<PREFIX>` in the line.
pub fn find_nmea_start(line: &str) -> Option<usize> {
    line.match_indices('!')
        .map(|(pos, _)| pos)
        .find(|pos| {
            let rest = &line[pos + 1..];
            NMEA_PREFIXES.iter().any(|prefix| rest.starts_with(prefix))
        })
}

/// Parses `!<PREFIX>,<total>,<part>,<seq_id>,` at the start of `sentence`.
pub fn parse_header(sentence: &str) -> Option<SentenceHeader<'_>> {
    let rest = sentence.strip_prefix('!')?;
    let prefix = NMEA_PREFIXES.iter().find(|p| rest.starts_with(**p))?;
    let rest = rest[prefix.len()..].strip_prefix(',')?;

    let mut fields = rest.splitn(4, ',');
    let total = parse_count(fields.next()?)?;
    let part = parse_count(fields.next()?)?;
    let seq_id = fields.next()?;
    // The sequence id must be followed by at least one more field.
    fields.next()?;

    if part == 0 || total == 0 || part > total {
        return None;
    }

    Some(SentenceHeader {
        total,
        part,
        seq_id,
    })
}

fn parse_count(field: &str) -> Option<u32> {
    if field.is_empty() || !field.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    field.parse().ok()
}

fn check_max_lines(max_lines: usize) -> Result<(), ConfigError> {
    if max_lines < 1 {
        return Err(ConfigError::invalid(
            "max_lines_per_packet",
            format!("must be at least 1, got {max_lines}"),
        ));
    }
    Ok(())
}

/// Lazily chunks `lines` without splitting multipart groups.
pub fn chunk_multipart<I>(
    lines: I,
    max_lines: usize,
    mode: ChunkMode,
) -> Result<MultipartChunks<I::IntoIter>, ConfigError>
where
    I: IntoIterator,
    I::Item: IntoLine,
{
    check_max_lines(max_lines)?;
    Ok(MultipartChunks {
        lines: lines.into_iter(),
        max_lines,
        mode,
        packet: Vec::new(),
        buffer: Vec::new(),
        open_group: None,
        done: false,
    })
}

/// Lazily chunks `lines` into batches of exactly `size` lines (the last may be shorter).
pub fn chunk_fixed<I>(lines: I, size: usize) -> Result<FixedChunks<I::IntoIter>, ConfigError>
where
    I: IntoIterator,
    I::Item: IntoLine,
{
    check_max_lines(size)?;
    Ok(FixedChunks {
        lines: lines.into_iter(),
        size,
        done: false,
    })
}

/// Picks the chunker at runtime.
pub fn chunk<I>(
    kind: ChunkerKind,
    lines: I,
    max_lines: usize,
    mode: ChunkMode,
) -> Result<Box<dyn Iterator<Item = ChunkResult> + Send>, ConfigError>
where
    I: IntoIterator,
    I::Item: IntoLine,
    I::IntoIter: Send + 'static,
{
    Ok(match kind {
        ChunkerKind::Fixed => Box::new(chunk_fixed(lines, max_lines)?),
        ChunkerKind::Multipart => Box::new(chunk_multipart(lines, max_lines, mode)?),
    })
}

#[derive(Debug)]
struct OpenGroup {
    seq_id: String,
    total: u32,
    last_part: u32,
}

pub struct MultipartChunks<I> {
    lines: I,
    max_lines: usize,
    mode: ChunkMode,
    packet: Vec<String>,
    buffer: Vec<String>,
    open_group: Option<OpenGroup>,
    done: bool,
}

enum Step {
    Continue,
    Ready(Vec<String>),
}

impl<I> MultipartChunks<I>
where
    I: Iterator,
    I::Item: IntoLine,
{
    fn fail(&mut self, err: ChunkError) -> Option<ChunkResult> {
        self.done = true;
        self.packet.clear();
        self.buffer.clear();
        Some(Err(err))
    }

    fn reject(&mut self, err: ChunkError) -> Result<Step, ChunkError> {
        match self.mode {
            ChunkMode::Strict => Err(err),
            ChunkMode::Lenient => {
                warn!("dropping sentence: {err}");
                Ok(Step::Continue)
            }
        }
    }

    fn push_line(&mut self, line: String) -> Result<Step, ChunkError> {
        let Some(start) = find_nmea_start(&line) else {
            return self.reject(ChunkError::UnrecognizedPrefix { line });
        };
        let Some(header) = parse_header(&line[start..]) else {
            return self.reject(ChunkError::MalformedHeader { line });
        };

        let in_sequence = match &self.open_group {
            Some(group) => {
                group.seq_id == header.seq_id
                    && group.total == header.total
                    && group.last_part + 1 == header.part
            }
            None => header.part == 1,
        };

        if !in_sequence {
            if self.mode == ChunkMode::Strict {
                return Err(ChunkError::OutOfSequence { line });
            }
            if !self.buffer.is_empty() {
                warn!(
                    "dropping {} sentences of an unfinished multipart group",
                    self.buffer.len()
                );
                self.buffer.clear();
                self.open_group = None;
            }
            if header.part != 1 {
                warn!("dropping out-of-sequence sentence: {line}");
                return Ok(Step::Continue);
            }
        }

        let (total, part) = (header.total, header.part);
        self.open_group = Some(OpenGroup {
            seq_id: header.seq_id.to_string(),
            total,
            last_part: part,
        });
        self.buffer.push(line);

        if part != total {
            return Ok(Step::Continue);
        }

        self.open_group = None;
        let group = std::mem::take(&mut self.buffer);
        if !self.packet.is_empty() && self.packet.len() + group.len() > self.max_lines {
            let ready = std::mem::replace(&mut self.packet, group);
            return Ok(Step::Ready(ready));
        }
        self.packet.extend(group);
        Ok(Step::Continue)
    }
}

impl<I> Iterator for MultipartChunks<I>
where
    I: Iterator,
    I::Item: IntoLine,
{
    type Item = ChunkResult;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        while let Some(item) = self.lines.next() {
            let line = match item.into_line() {
                Ok(line) => line,
                Err(e) => return self.fail(ChunkError::Io(e)),
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            match self.push_line(line.to_string()) {
                Ok(Step::Continue) => {}
                Ok(Step::Ready(packet)) => return Some(Ok(packet)),
                Err(e) => return self.fail(e),
            }
        }

        self.done = true;

        if !self.buffer.is_empty() {
            let lines = std::mem::take(&mut self.buffer);
            match self.mode {
                ChunkMode::Strict => return self.fail(ChunkError::IncompleteGroup { lines }),
                ChunkMode::Lenient => {
                    warn!(
                        "dropping {} sentences of an unfinished multipart group at end of stream",
                        lines.len()
                    );
                }
            }
        }

        if self.packet.is_empty() {
            None
        } else {
            Some(Ok(std::mem::take(&mut self.packet)))
        }
    }
}

pub struct FixedChunks<I> {
    lines: I,
    size: usize,
    done: bool,
}

impl<I> Iterator for FixedChunks<I>
where
    I: Iterator,
    I::Item: IntoLine,
{
    type Item = ChunkResult;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let mut chunk = Vec::with_capacity(self.size);
        for item in self.lines.by_ref() {
            match item.into_line() {
                Ok(line) => {
                    let line = line.trim();
                    if !line.is_empty() {
                        chunk.push(line.to_string());
                    }
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(ChunkError::Io(e)));
                }
            }
            if chunk.len() == self.size {
                return Some(Ok(chunk));
            }
        }

        self.done = true;
        (!chunk.is_empty()).then_some(Ok(chunk))
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn collect(lines: &[&str], max_lines: usize) -> Result<Vec<Vec<String>>, ChunkError> {
        chunk_multipart(lines.iter().copied(), max_lines, ChunkMode::Strict)
            .unwrap()
            .collect()
    }

    #[test]
    fn test_single_part_sentences_split_correctly() {
        let lines: Vec<String> = (0..45).map(|i| format!("!AIVDM,1,1,,A,data{i},0")).collect();
        let packets: Vec<_> = chunk_multipart(lines, 20, ChunkMode::Strict)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();

        let sizes: Vec<usize> = packets.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![20, 20, 5]);
    }

    #[test]
    fn test_multipart_not_split() {
        let lines = [
            "!AIVDM,2,1,abc,A,part1,0",
            "!AIVDM,2,2,abc,A,part2,0",
            "!AIVDM,1,1,,A,single1,0",
            "!AIVDM,2,1,def,A,part3,0",
            "!AIVDM,2,2,def,A,part4,0",
        ];
        let packets = collect(&lines, 3).unwrap();

        assert_eq!(packets, vec![lines[..3].to_vec(), lines[3..].to_vec()]);
    }

    #[test]
    fn test_multiple_multipart_sequences_in_one_packet() {
        let lines = [
            "!AIVDM,2,1,abc,A,part1,0",
            "!AIVDM,2,2,abc,A,part2,0",
            "!AIVDM,2,1,def,A,part3,0",
            "!AIVDM,2,2,def,A,part4,0",
        ];
        assert_eq!(collect(&lines, 10).unwrap(), vec![lines.to_vec()]);
    }

    #[test]
    fn test_oversized_group_travels_alone() {
        let lines = [
            "!AIVDM,1,1,,A,single,0",
            "!AIVDM,3,1,7,A,a,0",
            "!AIVDM,3,2,7,A,b,0",
            "!AIVDM,3,3,7,A,c,0",
            "!AIVDM,1,1,,B,tail,0",
        ];
        let packets = collect(&lines, 2).unwrap();

        assert_eq!(
            packets,
            vec![lines[..1].to_vec(), lines[1..4].to_vec(), lines[4..].to_vec()]
        );
    }

    #[test]
    fn test_tagblock_prefixed_lines() {
        let lines = [
            r"\s:rMT9999,c:1749945745*41\!AIVDM,2,1,2,B,569@?q00000091Ho@00HDU,0*42",
            r"\s:rMT9999,c:1749945745*41\!AIVDM,2,2,2,B,88888888880,2*25",
            r"\s:rMT7892,c:1749945745*45\!BSVDM,1,1,,A,13m0Nj01C@WPIfR1>5d0phnd00SN,0*44",
        ];
        assert_eq!(collect(&lines, 2).unwrap(), vec![lines[..2].to_vec(), lines[2..].to_vec()]);
    }

    #[test]
    fn test_blank_lines_are_skipped_and_lines_trimmed() {
        let lines = ["   ", " !AIVDM,1,1,,A,x,0 \r", ""];
        assert_eq!(collect(&lines, 5).unwrap(), vec![vec!["!AIVDM,1,1,,A,x,0"]]);
    }

    #[test]
    fn test_unrecognized_prefix_fails_without_partial_output() {
        let lines = [
            "!AIVDM,1,1,,A,ok,0",
            "!AIVDM,2,1,9,A,half,0",
            "garbage",
            "!AIVDM,2,2,9,A,other_half,0",
        ];
        let results: Vec<_> = chunk_multipart(lines, 10, ChunkMode::Strict)
            .unwrap()
            .collect();

        assert_eq!(results.len(), 1);
        match &results[0] {
            Err(ChunkError::UnrecognizedPrefix { line }) => assert_eq!(line, "garbage"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[rstest]
    #[case::missing_fields("!AIVDM,1")]
    #[case::non_numeric_total("!AIVDM,x,1,,A,data,0")]
    #[case::part_beyond_total("!AIVDM,1,2,,A,data,0")]
    #[case::zero_part("!AIVDM,1,0,,A,data,0")]
    #[case::no_comma_after_prefix("!AIVDMX,1,1,,A,data,0")]
    fn test_malformed_header(#[case] line: &str) {
        let err = collect(&[line], 5).unwrap_err();
        assert!(matches!(err, ChunkError::MalformedHeader { .. }), "{err:?}");
    }

    #[test]
    fn test_incomplete_group_at_end_fails() {
        let err = collect(&["!AIVDM,1,1,,A,x,0", "!AIVDM,2,1,3,A,y,0"], 5).unwrap_err();
        match err {
            ChunkError::IncompleteGroup { lines } => assert_eq!(lines, vec!["!AIVDM,2,1,3,A,y,0"]),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[rstest]
    #[case::interleaved_single(&["!AIVDM,2,1,xyz,A,p1,0", "!AIVDM,1,1,,A,single,0"])]
    #[case::other_group(&["!AIVDM,2,1,xyz,A,p1,0", "!AIVDM,2,1,abc,A,q1,0"])]
    #[case::starts_mid_group(&["!AIVDM,2,2,xyz,A,p2,0"])]
    #[case::repeated_part(&["!AIVDM,3,1,1,A,a,0", "!AIVDM,3,1,1,A,a,0"])]
    fn test_out_of_sequence(#[case] lines: &[&str]) {
        let err = collect(lines, 5).unwrap_err();
        assert!(matches!(err, ChunkError::OutOfSequence { .. }), "{err:?}");
    }

    #[test]
    fn test_lenient_mode_skips_invalid_lines() {
        let lines = [
            "  ",
            "garbage",
            "!AIVDM,1,1,,A,single1,0",
            "more garbage",
            "!AIVDM,1,1,,A,single2,0",
        ];
        let packets: Vec<_> = chunk_multipart(lines, 2, ChunkMode::Lenient)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();

        assert_eq!(packets, vec![vec!["!AIVDM,1,1,,A,single1,0", "!AIVDM,1,1,,A,single2,0"]]);
    }

    #[test]
    fn test_lenient_mode_drops_broken_groups() {
        let lines = [
            "!AIVDM,2,1,xyz,A,part1,0",
            "!AIVDM,1,1,,A,single,0",
            "!AIVDM,2,2,xyz,A,part2,0",
            "!AIVDM,2,1,end,A,dangling,0",
        ];
        let packets: Vec<_> = chunk_multipart(lines, 2, ChunkMode::Lenient)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();

        assert_eq!(packets, vec![vec!["!AIVDM,1,1,,A,single,0"]]);
    }

    #[test]
    fn test_zero_max_lines_is_config_error() {
        assert!(chunk_multipart(Vec::<String>::new(), 0, ChunkMode::Strict).is_err());
        assert!(chunk_fixed(Vec::<String>::new(), 0).is_err());
    }

    #[test]
    fn test_read_error_surfaces() {
        let lines = vec![
            Ok("!AIVDM,1,1,,A,x,0".to_string()),
            Err(io::Error::new(io::ErrorKind::InvalidData, "bad gzip")),
        ];
        let results: Vec<_> = chunk_multipart(lines, 5, ChunkMode::Strict).unwrap().collect();
        assert!(matches!(results.as_slice(), [Err(ChunkError::Io(_))]));
    }

    #[test]
    fn test_fixed_chunks() {
        let lines: Vec<String> = (0..7).map(|i| format!("line{i}")).collect();
        let sizes: Vec<usize> = chunk_fixed(lines, 3)
            .unwrap()
            .map(|chunk| chunk.unwrap().len())
            .collect();
        assert_eq!(sizes, vec![3, 3, 1]);
    }

    #[rstest]
    #[case("!AIVDM,2,1,abc,A,x,0", Some((2, 1, "abc")))]
    #[case("!ANVDO,1,1,,B,x,0", Some((1, 1, "")))]
    #[case("!GPGGA,1,1,,B,x,0", None)]
    #[case("!AIVDM,10,10,5,A,x,0", Some((10, 10, "5")))]
    fn test_parse_header(#[case] sentence: &str, #[case] expected: Option<(u32, u32, &str)>) {
        let parsed = parse_header(sentence).map(|h| (h.total, h.part, h.seq_id));
        assert_eq!(parsed, expected);
    }

    #[test]
    fn test_find_nmea_start() {
        assert_eq!(find_nmea_start(r"\c:1*00\!AIVDM,1,1,,A,x,0"), Some(8));
        assert_eq!(find_nmea_start("!AIVDO,1,1,,A,x,0"), Some(0));
        assert_eq!(find_nmea_start("$GPGGA,1"), None);
    }

    #[test]
    fn test_chunker_kind_from_str() {
        assert_eq!("Multipart".parse::<ChunkerKind>().unwrap(), ChunkerKind::Multipart);
        assert_eq!("fixed".parse::<ChunkerKind>().unwrap(), ChunkerKind::Fixed);
        assert!("other".parse::<ChunkerKind>().is_err());
    }
}
