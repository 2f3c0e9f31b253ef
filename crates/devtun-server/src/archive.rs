//! Directory-to-chunk-stream archiving.
//!
//! The tar archive is produced on a blocking thread and pushed through a
//! buffered writer that cuts it into [`Chunk`]s, logging throughput as it
//! goes.

use bytes::Bytes;
use devtun_core::{Chunk, ChunkStream, TunnelError, TunnelResult};
use futures::StreamExt;
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

/// Bytes buffered before a chunk is emitted.
pub const CHUNK_BUFFER: usize = 10 * 1024;

/// How often progress is logged.
pub const PROGRESS_INTERVAL: Duration = Duration::from_secs(2);

/// Name of the ignore file read from the archived root.
pub const IGNORE_FILE: &str = ".devpodignore";

/// Logs the running byte total at most once per interval.
#[derive(Debug)]
pub struct Throughput {
    total: u64,
    last: Instant,
    interval: Duration,
}

impl Throughput {
    pub fn new(interval: Duration) -> Self {
        Self {
            total: 0,
            last: Instant::now(),
            interval,
        }
    }

    pub fn record(&mut self, n: usize) {
        self.total += n as u64;
        if self.last.elapsed() >= self.interval {
            self.last = Instant::now();
            info!("Uploaded {:.2} MB", self.total as f64 / 1024.0 / 1024.0);
        }
    }

    pub fn total(&self) -> u64 {
        self.total
    }
}

/// `io::Write` sink that turns every write into one chunk on a channel.
/// Wrap it in a `BufWriter` to get evenly sized chunks.
struct ChunkSink {
    tx: mpsc::Sender<TunnelResult<Chunk>>,
    progress: Throughput,
}

impl Write for ChunkSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let chunk = Chunk {
            content: Bytes::copy_from_slice(buf),
        };
        self.tx
            .blocking_send(Ok(chunk))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "chunk receiver dropped"))?;
        self.progress.record(buf.len());
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// `.devpodignore` rules for one archive root, with gitignore semantics.
#[derive(Debug, Clone)]
pub struct IgnoreRules {
    matcher: Gitignore,
}

impl Default for IgnoreRules {
    fn default() -> Self {
        Self {
            matcher: Gitignore::empty(),
        }
    }
}

impl IgnoreRules {
    /// Build rules from ignore-file text. Bad patterns are skipped.
    pub fn parse(root: &Path, text: &str) -> Self {
        let mut builder = GitignoreBuilder::new(root);
        for line in text.lines() {
            if let Err(e) = builder.add_line(None, line) {
                warn!(pattern = %line.trim(), error = %e, "skipping bad ignore pattern");
            }
        }
        match builder.build() {
            Ok(matcher) => Self { matcher },
            Err(e) => {
                warn!(error = %e, "ignoring {IGNORE_FILE}");
                Self::default()
            }
        }
    }

    /// Read the ignore file under `root`, if there is one.
    pub fn load(root: &Path) -> Self {
        match std::fs::read_to_string(root.join(IGNORE_FILE)) {
            Ok(text) => Self::parse(root, &text),
            Err(_) => Self::default(),
        }
    }

    /// `rel` is a `/`-separated path relative to the archive root.
    pub fn is_excluded(&self, rel: &str, is_dir: bool) -> bool {
        let rel = rel.trim_start_matches('/');
        if rel.is_empty() {
            return false;
        }
        self.matcher
            .matched_path_or_any_parents(rel, is_dir)
            .is_ignore()
    }
}

/// Archive `root` as a tar stream of chunks.
pub fn archive_dir(root: PathBuf, rules: IgnoreRules) -> ChunkStream {
    let (tx, rx) = mpsc::channel::<TunnelResult<Chunk>>(16);
    tokio::task::spawn_blocking(move || {
        debug!(root = %root.display(), "archiving directory");
        let sink = ChunkSink {
            tx: tx.clone(),
            progress: Throughput::new(PROGRESS_INTERVAL),
        };
        if let Err(e) = write_tar(&root, &rules, sink) {
            let _ = tx.blocking_send(Err(TunnelError::Io(e)));
        }
    });
    ReceiverStream::new(rx).boxed()
}

fn write_tar(root: &Path, rules: &IgnoreRules, sink: ChunkSink) -> io::Result<()> {
    let mut builder = tar::Builder::new(BufWriter::with_capacity(CHUNK_BUFFER, sink));
    builder.follow_symlinks(false);
    append_tree(&mut builder, root, root, rules)?;
    let mut buffered = builder.into_inner()?;
    buffered.flush()?;
    let sink = buffered.into_inner().map_err(|e| e.into_error())?;
    info!(
        "Uploaded {:.2} MB",
        sink.progress.total() as f64 / 1024.0 / 1024.0
    );
    Ok(())
}

fn append_tree<W: Write>(
    builder: &mut tar::Builder<W>,
    root: &Path,
    dir: &Path,
    rules: &IgnoreRules,
) -> io::Result<()> {
    let mut entries = std::fs::read_dir(dir)?.collect::<Result<Vec<_>, _>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let path = entry.path();
        let file_type = entry.file_type()?;
        let rel = path
            .strip_prefix(root)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let rel_str = rel.to_string_lossy().replace('\\', "/");
        if rules.is_excluded(&rel_str, file_type.is_dir()) {
            continue;
        }

        builder.append_path_with_name(&path, rel)?;
        if file_type.is_dir() {
            append_tree(builder, root, &path, rules)?;
        }
    }
    Ok(())
}

/// Re-buffer an upstream chunk stream into evenly sized chunks, logging
/// throughput along the way.
pub fn rechunk(upstream: ChunkStream) -> ChunkStream {
    let reader = devtun_client::chunk_reader(upstream);
    let mut progress = Throughput::new(PROGRESS_INTERVAL);
    tokio_util::io::ReaderStream::with_capacity(reader, CHUNK_BUFFER)
        .map(move |bytes| -> TunnelResult<Chunk> {
            let bytes = bytes?;
            progress.record(bytes.len());
            Ok(Chunk { content: bytes })
        })
        .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::io::Read;

    async fn collect(stream: ChunkStream) -> Vec<u8> {
        let chunks: Vec<Chunk> = stream.map(|c| c.unwrap()).collect().await;
        for c in &chunks {
            assert!(c.content.len() <= CHUNK_BUFFER);
        }
        chunks.iter().flat_map(|c| c.content.to_vec()).collect()
    }

    fn entries(tar_bytes: &[u8]) -> BTreeMap<String, Vec<u8>> {
        let mut archive = tar::Archive::new(tar_bytes);
        let mut out = BTreeMap::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let name = entry.path().unwrap().to_string_lossy().trim_end_matches('/').to_string();
            let mut data = Vec::new();
            entry.read_to_end(&mut data).unwrap();
            out.insert(name, data);
        }
        out
    }

    fn rules(text: &str) -> IgnoreRules {
        IgnoreRules::parse(Path::new("/workspace"), text)
    }

    #[test]
    fn ignore_rules() {
        let rules = rules("# comment\nnode_modules\n*.log\nbuild/\n/docs/private\n");
        assert!(rules.is_excluded("node_modules", true));
        assert!(rules.is_excluded("web/node_modules/x.js", false));
        assert!(rules.is_excluded("debug.log", false));
        assert!(rules.is_excluded("build", true));
        assert!(!rules.is_excluded("build", false));
        assert!(rules.is_excluded("docs/private/a.md", false));
        assert!(!rules.is_excluded("docs/public.md", false));
        assert!(!rules.is_excluded("src/main.rs", false));
    }

    #[test]
    fn ignore_rules_with_inner_and_double_stars() {
        let rules = rules("logs/*.log\n**/*.tmp\nfoo*bar\n");
        assert!(rules.is_excluded("logs/a.log", false));
        assert!(!rules.is_excluded("other/a.log", false));
        assert!(rules.is_excluded("x/y.tmp", false));
        assert!(rules.is_excluded("y.tmp", false));
        assert!(rules.is_excluded("fooXbar", false));
        assert!(rules.is_excluded("deep/fooXYZbar", false));
        assert!(!rules.is_excluded("foobaz", false));
    }

    #[test]
    fn negated_pattern_keeps_file() {
        let rules = rules("*.env\n!public.env\n");
        assert!(rules.is_excluded("secret.env", false));
        assert!(!rules.is_excluded("public.env", false));
    }

    #[tokio::test]
    async fn archives_tree_with_excludes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::create_dir_all(dir.path().join("target/debug")).unwrap();
        std::fs::write(dir.path().join("src/main.rs"), "fn main() {}").unwrap();
        std::fs::write(dir.path().join("target/debug/app"), vec![7u8; 50_000]).unwrap();
        std::fs::write(dir.path().join(IGNORE_FILE), "target/\n").unwrap();
        let big: Vec<u8> = (0..40_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(dir.path().join("data.bin"), &big).unwrap();

        let root = dir.path().to_path_buf();
        let rules = IgnoreRules::load(&root);
        let bytes = collect(archive_dir(root, rules)).await;
        let files = entries(&bytes);

        assert_eq!(files["src/main.rs"], b"fn main() {}");
        assert_eq!(files["data.bin"], big);
        assert!(files.keys().all(|k| !k.starts_with("target")));
    }

    #[tokio::test]
    async fn missing_root_yields_error_item() {
        let stream = archive_dir(PathBuf::from("/definitely/not/here"), IgnoreRules::default());
        let items: Vec<TunnelResult<Chunk>> = stream.collect().await;
        assert!(items.last().unwrap().is_err());
    }

    #[tokio::test]
    async fn rechunk_preserves_bytes() {
        let pieces: Vec<TunnelResult<Chunk>> = (0..100u8)
            .map(|i| {
                Ok(Chunk {
                    content: Bytes::from(vec![i; 333]),
                })
            })
            .collect();
        let expected: Vec<u8> = (0..100u8).flat_map(|i| vec![i; 333]).collect();
        let out = collect(rechunk(futures::stream::iter(pieces).boxed())).await;
        assert_eq!(out, expected);
    }
}
