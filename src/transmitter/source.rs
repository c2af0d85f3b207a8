use std::{
    fs::File,
    io::{self, BufRead, BufReader},
    path::{Path, PathBuf},
};

use flate2::read::MultiGzDecoder;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{
    chunker::{chunk, ChunkMode, ChunkerKind},
    error::TransmitterError,
};

type Lines = Box<dyn Iterator<Item = io::Result<String>> + Send>;

/// How the lines of every source file are cut into chunks.
#[derive(Debug, Clone, Copy)]
pub struct SourceSettings {
    pub chunker: ChunkerKind,
    pub chunk_size: usize,
    pub mode: ChunkMode,
    pub first_n: Option<usize>,
}

#[derive(Debug)]
pub enum SourceEvent {
    File(PathBuf),
    Chunk(Vec<String>),
}

/// `path` itself, or the regular files directly inside it in name order.
pub fn list_files(path: &Path) -> Result<Vec<PathBuf>, TransmitterError> {
    let source_err = |source| TransmitterError::Source {
        path: path.display().to_string(),
        source,
    };

    if !path.is_dir() {
        if !path.exists() {
            return Err(source_err(io::Error::new(
                io::ErrorKind::NotFound,
                "no such file or directory",
            )));
        }
        return Ok(vec![path.to_path_buf()]);
    }

    let mut files = Vec::new();
    for entry in std::fs::read_dir(path).map_err(source_err)? {
        let entry_path = entry.map_err(source_err)?.path();
        if entry_path.is_dir() {
            warn!("skipping subdirectory {}", entry_path.display());
            continue;
        }
        files.push(entry_path);
    }
    files.sort();
    Ok(files)
}

/// Lazily reads the lines of `path`, decompressing `.gz` files.
pub fn open_lines(path: &Path) -> io::Result<Lines> {
    let file = File::open(path)?;
    let is_gzip = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("gz"));

    Ok(if is_gzip {
        Box::new(BufReader::new(MultiGzDecoder::new(file)).lines())
    } else {
        Box::new(BufReader::new(file).lines())
    })
}

/// Reads and chunks `files` on a blocking thread, one event at a time.
///
/// The reader stops after the first error it sends, or as soon as the receiver is dropped.
pub fn spawn_chunk_reader(
    files: Vec<PathBuf>,
    settings: SourceSettings,
) -> mpsc::Receiver<Result<SourceEvent, TransmitterError>> {
    let (event_tx, event_rx) = mpsc::channel(4);

    tokio::task::spawn_blocking(move || {
        for path in files {
            if event_tx.blocking_send(Ok(SourceEvent::File(path.clone()))).is_err() {
                return;
            }
            if let Err(e) = read_file(&path, settings, &event_tx) {
                _ = event_tx.blocking_send(Err(e));
                return;
            }
        }
        debug!("chunk reader finished");
    });

    event_rx
}

fn read_file(
    path: &Path,
    settings: SourceSettings,
    event_tx: &mpsc::Sender<Result<SourceEvent, TransmitterError>>,
) -> Result<(), TransmitterError> {
    let lines = open_lines(path).map_err(|source| TransmitterError::Source {
        path: path.display().to_string(),
        source,
    })?;
    let lines: Lines = match settings.first_n {
        Some(n) => Box::new(lines.take(n)),
        None => lines,
    };

    for chunk in chunk(settings.chunker, lines, settings.chunk_size, settings.mode)? {
        if event_tx.blocking_send(Ok(SourceEvent::Chunk(chunk?))).is_err() {
            break;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use flate2::{write::GzEncoder, Compression};

    use super::*;

    fn write_gz(path: &Path, content: &str) {
        let mut encoder = GzEncoder::new(File::create(path).unwrap(), Compression::default());
        encoder.write_all(content.as_bytes()).unwrap();
        encoder.finish().unwrap();
    }

    #[test]
    fn test_list_files_sorted_without_subdirs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.nmea"), "").unwrap();
        std::fs::write(dir.path().join("a.nmea"), "").unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();

        let files = list_files(dir.path()).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|f| f.file_name().unwrap().to_str().unwrap())
            .collect();
        assert_eq!(names, ["a.nmea", "b.nmea"]);
    }

    #[test]
    fn test_list_missing_path() {
        assert!(matches!(
            list_files(Path::new("/definitely/not/here")),
            Err(TransmitterError::Source { .. })
        ));
    }

    #[test]
    fn test_open_plain_and_gzip() {
        let dir = tempfile::tempdir().unwrap();
        let plain = dir.path().join("feed.txt");
        let gz = dir.path().join("feed.txt.GZ");
        std::fs::write(&plain, "a\r\nb\n").unwrap();
        write_gz(&gz, "a\r\nb\n");

        for path in [plain, gz] {
            let lines: Vec<String> = open_lines(&path).unwrap().map(Result::unwrap).collect();
            assert_eq!(lines, ["a", "b"]);
        }
    }

    #[tokio::test]
    async fn test_chunk_reader_applies_first_n_per_file() {
        let dir = tempfile::tempdir().unwrap();
        let body: String = (0..5).map(|i| format!("!AIVDM,1,1,,A,m{i},0\n")).collect();
        std::fs::write(dir.path().join("1.nmea"), &body).unwrap();
        write_gz(&dir.path().join("2.nmea.gz"), &body);

        let settings = SourceSettings {
            chunker: ChunkerKind::Multipart,
            chunk_size: 2,
            mode: ChunkMode::Strict,
            first_n: Some(3),
        };
        let mut events = spawn_chunk_reader(list_files(dir.path()).unwrap(), settings);

        let mut files = 0;
        let mut sizes = Vec::new();
        while let Some(event) = events.recv().await {
            match event.unwrap() {
                SourceEvent::File(_) => files += 1,
                SourceEvent::Chunk(lines) => sizes.push(lines.len()),
            }
        }
        assert_eq!(files, 2);
        assert_eq!(sizes, [2, 1, 2, 1]);
    }

    #[tokio::test]
    async fn test_chunk_reader_stops_on_unrecognized_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.nmea");
        std::fs::write(&path, "!AIVDM,1,1,,A,ok,0\ngarbage\n!AIVDM,1,1,,A,late,0\n").unwrap();

        let settings = SourceSettings {
            chunker: ChunkerKind::Multipart,
            chunk_size: 10,
            mode: ChunkMode::Strict,
            first_n: None,
        };
        let mut events = spawn_chunk_reader(vec![path], settings);

        assert!(matches!(events.recv().await, Some(Ok(SourceEvent::File(_)))));
        assert!(matches!(
            events.recv().await,
            Some(Err(TransmitterError::Chunk(_)))
        ));
        assert!(events.recv().await.is_none());
    }
}
