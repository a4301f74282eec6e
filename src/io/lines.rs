use super::{common, ReadError, Record, WriteError};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::time::{Duration, Instant};

pub struct LineWriter {
    file: File,
    writer: BufWriter<File>,
    lock_timeout: Duration,
}

impl LineWriter {
    /// Open a row file for appending.
    ///
    /// The lock is acquired only around write operations, not
    /// continuously, so readers can access the file between batches.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, WriteError> {
        Self::open_with_timeout(path, Duration::from_secs(0))
    }

    /// Open with a timeout for acquiring the lock during writes.
    pub fn open_with_timeout(
        path: impl AsRef<Path>,
        timeout: Duration,
    ) -> Result<Self, WriteError> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let writer = BufWriter::new(file.try_clone()?);
        Ok(Self {
            file,
            writer,
            lock_timeout: timeout,
        })
    }

    /// Acquire exclusive lock with the configured timeout.
    fn acquire_lock(&self) -> Result<(), WriteError> {
        let start = Instant::now();
        let retry_interval = Duration::from_millis(100);

        loop {
            match self.file.try_lock_exclusive() {
                Ok(()) => return Ok(()),
                Err(_) if self.lock_timeout.is_zero() => {
                    return Err(WriteError::AlreadyLocked);
                }
                Err(_) if start.elapsed() >= self.lock_timeout => {
                    return Err(WriteError::LockTimeout(self.lock_timeout));
                }
                Err(_) => {
                    std::thread::sleep(retry_interval);
                }
            }
        }
    }

    /// Write a batch of records atomically.
    ///
    /// The whole batch is encoded to memory first; if any record fails to
    /// encode, nothing reaches the file. After a successful write, fsync
    /// makes the rows durable before the lock is released.
    pub fn write_batch<R: Record>(&mut self, records: &[R]) -> Result<(), WriteError> {
        let buffer = common::encode_batch(records)?;

        // Lock held only for the duration of the write.
        self.acquire_lock()?;

        let result = (|| {
            self.writer.write_all(&buffer)?;
            self.writer.flush()?;
            self.file.sync_all()?;
            Ok(())
        })();

        // Always release the lock, even on error.
        let _ = FileExt::unlock(&self.file);

        result
    }
}

pub struct LineReader<R> {
    reader: BufReader<File>,
    _phantom: std::marker::PhantomData<R>,
}

impl<R> LineReader<R> {
    /// Open a row file for reading.
    ///
    /// Acquires a shared lock immediately or fails; the lock is held for
    /// the reader's lifetime.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ReadError> {
        Self::open_with_timeout(path, Duration::from_secs(0))
    }

    /// Open with a timeout for acquiring the lock.
    pub fn open_with_timeout(path: impl AsRef<Path>, timeout: Duration) -> Result<Self, ReadError> {
        let file = OpenOptions::new().read(true).open(path)?;

        let start = Instant::now();
        let retry_interval = Duration::from_millis(100);

        loop {
            match FileExt::try_lock_shared(&file) {
                Ok(()) => {
                    let reader = BufReader::new(file);
                    return Ok(Self {
                        reader,
                        _phantom: std::marker::PhantomData,
                    });
                }
                Err(_) if timeout.is_zero() => {
                    return Err(ReadError::AlreadyLocked);
                }
                Err(_) if start.elapsed() >= timeout => {
                    return Err(ReadError::LockTimeout(timeout));
                }
                Err(_) => {
                    std::thread::sleep(retry_interval);
                }
            }
        }
    }
}

impl<R: Record> Iterator for LineReader<R> {
    type Item = Result<R, ReadError>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut line = String::new();

        loop {
            line.clear();
            match self.reader.read_line(&mut line) {
                Ok(0) => return None, // EOF
                Ok(_) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue; // Skip empty lines
                    }

                    return Some(R::decode(trimmed));
                }
                Err(e) => return Some(Err(ReadError::Io(e))),
            }
        }
    }
}
