use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::model::Event;
use crate::observability;

const WRITER_QUEUE: usize = 4096;

/// Largest encoded event. A length prefix above this is treated as corruption.
pub const MAX_RECORD_LEN: usize = 1024 * 1024;

fn encode_record(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if payload.len() > MAX_RECORD_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "WAL record too large"));
    }
    writer.write_all(&(payload.len() as u32).to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(())
}

/// Fill `buf` completely. `Ok(false)` when the file ends first.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Append-only write-ahead log of scheduling events.
///
/// Record layout: `[u32 le: payload len][bincode Event][u32 le: crc32 of payload]`.
/// A torn or corrupt tail left by a crash is dropped on replay.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    /// Buffer one record. Nothing is durable until [`Wal::flush_sync`].
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        encode_record(&mut self.writer, event)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    fn tmp_path(&self) -> PathBuf {
        self.path.with_extension("wal.tmp")
    }

    /// Replace the log with `events`: write a synced temp file, then rename it
    /// over the live log and reopen for appending.
    pub fn rewrite(&mut self, events: &[Event]) -> io::Result<()> {
        let tmp = self.tmp_path();
        {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            for event in events {
                encode_record(&mut writer, event)?;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    /// Read every intact record. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();
        let mut word = [0u8; 4];

        loop {
            if !read_full(&mut reader, &mut word)? {
                break;
            }
            let len = u32::from_le_bytes(word) as usize;
            if len > MAX_RECORD_LEN {
                warn!(path = %path.display(), records = events.len(), len, "oversized WAL record length, stopping replay");
                break;
            }
            let mut payload = vec![0u8; len];
            if !read_full(&mut reader, &mut payload)? || !read_full(&mut reader, &mut word)? {
                warn!(path = %path.display(), records = events.len(), "discarding truncated WAL tail");
                break;
            }
            if u32::from_le_bytes(word) != crc32fast::hash(&payload) {
                warn!(path = %path.display(), records = events.len(), "WAL checksum mismatch, stopping replay");
                break;
            }
            match bincode::deserialize::<Event>(&payload) {
                Ok(event) => events.push(event),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "undecodable WAL record, stopping replay");
                    break;
                }
            }
        }

        Ok(events)
    }
}

// ── Group-commit writer ──────────────────────────────────

type Reply<T> = oneshot::Sender<T>;

enum Command {
    Append {
        event: Event,
        reply: Reply<io::Result<()>>,
    },
    Rewrite {
        events: Vec<Event>,
        reply: Reply<io::Result<()>>,
    },
    AppendsSinceCompact {
        reply: Reply<u64>,
    },
}

/// Handle to the task that owns the [`Wal`].
///
/// Appends that arrive while a flush is in progress are queued and committed
/// together with a single fsync.
#[derive(Clone)]
pub struct WalWriter {
    tx: mpsc::Sender<Command>,
}

fn writer_gone() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "WAL writer shut down")
}

impl WalWriter {
    /// Move `wal` onto a background task. Must be called inside a tokio runtime.
    pub fn spawn(wal: Wal) -> Self {
        let (tx, rx) = mpsc::channel(WRITER_QUEUE);
        tokio::spawn(writer_loop(wal, rx));
        Self { tx }
    }

    /// Resolves once `event` is fsynced.
    pub async fn append(&self, event: Event) -> io::Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Append { event, reply })
            .await
            .map_err(|_| writer_gone())?;
        rx.await.map_err(|_| writer_gone())?
    }

    pub async fn rewrite(&self, events: Vec<Event>) -> io::Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Rewrite { events, reply })
            .await
            .map_err(|_| writer_gone())?;
        rx.await.map_err(|_| writer_gone())?
    }

    pub async fn appends_since_compact(&self) -> u64 {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::AppendsSinceCompact { reply }).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

async fn writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<Command>) {
    let mut batch: Vec<Reply<io::Result<()>>> = Vec::new();

    while let Some(first) = rx.recv().await {
        let mut next = Some(first);
        while let Some(cmd) = next.take() {
            match cmd {
                Command::Append { event, reply } => {
                    if let Err(e) = wal.append_buffered(&event) {
                        let _ = reply.send(Err(e));
                    } else {
                        batch.push(reply);
                    }
                }
                Command::Rewrite { events, reply } => {
                    commit(&mut wal, &mut batch);
                    let _ = reply.send(wal.rewrite(&events));
                }
                Command::AppendsSinceCompact { reply } => {
                    let _ = reply.send(wal.appends_since_compact());
                }
            }
            next = rx.try_recv().ok();
        }
        commit(&mut wal, &mut batch);
    }
}

/// Flush and fsync everything buffered, then answer every waiting appender.
fn commit(wal: &mut Wal, batch: &mut Vec<Reply<io::Result<()>>>) {
    if batch.is_empty() {
        return;
    }
    metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = Instant::now();
    let result = wal.flush_sync();
    metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    for reply in batch.drain(..) {
        let outcome = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = reply.send(outcome);
    }
}
