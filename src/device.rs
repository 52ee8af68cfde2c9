//! The abstract block-device collaborator.
//!
//! The engine only consumes a small async trait over positioned block I/O,
//! never a concrete filesystem type. Production code plugs in a file-backed
//! implementation; tests plug in [`InMemoryBlockDevice`].

use std::io;
use std::sync::Arc;

use async_trait::async_trait;

/// A flat array of sectors that supports positioned read/write, a flush
/// (durability barrier), and discard.
///
/// All offsets and lengths are in units of [`crate::format::constants::LBS`]
/// (logical blocks), matching the host-visible addressing used throughout
/// this crate. Implementations are responsible for translating that into
/// whatever addressing their backing storage actually uses.
#[async_trait]
pub trait BlockDevice: Send + Sync {
    /// Total capacity of the device, in logical blocks.
    fn capacity_lbs(&self) -> u64;

    /// Reads `buf.len() / LBS` logical blocks starting at `lb_offset` into
    /// `buf`.
    ///
    /// # Errors
    /// Returns an error if the read could not be completed in full.
    async fn read_at(&self, lb_offset: u64, buf: &mut [u8]) -> io::Result<()>;

    /// Writes `buf.len() / LBS` logical blocks starting at `lb_offset`.
    ///
    /// # Errors
    /// Returns an error if the write could not be completed in full.
    async fn write_at(&self, lb_offset: u64, buf: &[u8]) -> io::Result<()>;

    /// Issues a durability barrier: once this returns, every prior
    /// `write_at` on this device is guaranteed durable.
    ///
    /// # Errors
    /// Returns an error if the flush could not be completed.
    async fn flush(&self) -> io::Result<()>;

    /// Hints that the logical blocks in `[lb_offset, lb_offset + lb_count)`
    /// no longer hold meaningful data.
    ///
    /// # Errors
    /// Returns an error if the discard could not be issued. Implementations
    /// that cannot discard may treat this as a no-op success.
    async fn discard(&self, lb_offset: u64, lb_count: u64) -> io::Result<()>;
}

/// An in-memory [`BlockDevice`], used by tests and by the crate's own
/// redo/crash-recovery scenarios.
pub struct InMemoryBlockDevice {
    inner: parking_lot::Mutex<Vec<u8>>,
    /// If set, `write_at` calls beyond this many total bytes silently
    /// succeed without touching `inner`, simulating a crash after the
    /// payload reached the device's write cache but nothing further.
    fail_after_bytes: parking_lot::Mutex<Option<u64>>,
    written_bytes: std::sync::atomic::AtomicU64,
}

impl InMemoryBlockDevice {
    pub fn new(capacity_lbs: u64) -> Arc<Self> {
        Arc::new(Self {
            inner: parking_lot::Mutex::new(vec![0u8; (capacity_lbs * super::format::constants::LBS) as usize]),
            fail_after_bytes: parking_lot::Mutex::new(None),
            written_bytes: std::sync::atomic::AtomicU64::new(0),
        })
    }

    /// From this call onward, any `write_at` whose cumulative byte count
    /// (across the whole device's lifetime) exceeds `n` is dropped instead
    /// of applied, simulating an abrupt crash.
    pub fn fail_writes_after(&self, n: u64) {
        *self.fail_after_bytes.lock() = Some(n);
    }

    /// Snapshot of the raw bytes, for test assertions.
    pub fn snapshot(&self) -> Vec<u8> {
        self.inner.lock().clone()
    }
}

#[async_trait]
impl BlockDevice for InMemoryBlockDevice {
    fn capacity_lbs(&self) -> u64 {
        self.inner.lock().len() as u64 / super::format::constants::LBS
    }

    async fn read_at(&self, lb_offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let lbs = super::format::constants::LBS;
        let start = (lb_offset * lbs) as usize;
        let end = start + buf.len();
        let inner = self.inner.lock();
        if end > inner.len() {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "read past device end"));
        }
        buf.copy_from_slice(&inner[start..end]);
        Ok(())
    }

    async fn write_at(&self, lb_offset: u64, buf: &[u8]) -> io::Result<()> {
        let already_written = self
            .written_bytes
            .fetch_add(buf.len() as u64, std::sync::atomic::Ordering::SeqCst);
        if let Some(limit) = *self.fail_after_bytes.lock() {
            if already_written >= limit {
                return Ok(());
            }
        }

        let lbs = super::format::constants::LBS;
        let start = (lb_offset * lbs) as usize;
        let end = start + buf.len();
        let mut inner = self.inner.lock();
        if end > inner.len() {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "write past device end"));
        }
        inner[start..end].copy_from_slice(buf);
        Ok(())
    }

    async fn flush(&self) -> io::Result<()> {
        Ok(())
    }

    async fn discard(&self, lb_offset: u64, lb_count: u64) -> io::Result<()> {
        let lbs = super::format::constants::LBS;
        let start = (lb_offset * lbs) as usize;
        let end = start + (lb_count * lbs) as usize;
        let mut inner = self.inner.lock();
        if end > inner.len() {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "discard past device end"));
        }
        inner[start..end].fill(0);
        Ok(())
    }
}

/// A file-backed [`BlockDevice`] for production use, built on `tokio::fs`.
///
/// Unlike [`InMemoryBlockDevice`], reads/writes take an exclusive lock on
/// the file handle around each positioned operation, since `tokio::fs::File`
/// does not expose an unlocked `pread`/`pwrite` pair. This mirrors how the
/// teacher crate serializes access to a single `tokio::fs::File` through its
/// own buffered writer rather than assuming concurrent positioned I/O.
pub struct FileBlockDevice {
    file: tokio::sync::Mutex<tokio::fs::File>,
    capacity_lbs: u64,
}

impl FileBlockDevice {
    pub async fn open(path: &std::path::Path, capacity_lbs: u64) -> io::Result<Self> {
        let file = tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .await?;
        file.set_len(capacity_lbs * super::format::constants::LBS).await?;
        Ok(Self {
            file: tokio::sync::Mutex::new(file),
            capacity_lbs,
        })
    }
}

#[async_trait]
impl BlockDevice for FileBlockDevice {
    fn capacity_lbs(&self) -> u64 {
        self.capacity_lbs
    }

    async fn read_at(&self, lb_offset: u64, buf: &mut [u8]) -> io::Result<()> {
        use tokio::io::{AsyncReadExt, AsyncSeekExt};
        let mut file = self.file.lock().await;
        file.seek(io::SeekFrom::Start(lb_offset * super::format::constants::LBS))
            .await?;
        file.read_exact(buf).await?;
        Ok(())
    }

    async fn write_at(&self, lb_offset: u64, buf: &[u8]) -> io::Result<()> {
        use tokio::io::{AsyncSeekExt, AsyncWriteExt};
        let mut file = self.file.lock().await;
        file.seek(io::SeekFrom::Start(lb_offset * super::format::constants::LBS))
            .await?;
        file.write_all(buf).await?;
        Ok(())
    }

    async fn flush(&self) -> io::Result<()> {
        let file = self.file.lock().await;
        file.sync_data().await
    }

    async fn discard(&self, lb_offset: u64, lb_count: u64) -> io::Result<()> {
        // No portable discard primitive through `tokio::fs`; zero the
        // range instead, which preserves the "reads as zero" contract
        // without requiring platform-specific `fallocate`/`FALLOC_FL_PUNCH_HOLE`.
        let lbs = super::format::constants::LBS;
        let zeros = vec![0u8; (lb_count * lbs) as usize];
        self.write_at(lb_offset, &zeros).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_device_round_trips() {
        let dev = InMemoryBlockDevice::new(16);
        let payload = vec![0xA5u8; 512 * 4];
        dev.write_at(2, &payload).await.unwrap();

        let mut read_back = vec![0u8; 512 * 4];
        dev.read_at(2, &mut read_back).await.unwrap();
        assert_eq!(payload, read_back);
    }

    #[tokio::test]
    async fn in_memory_device_discard_zeroes() {
        let dev = InMemoryBlockDevice::new(16);
        dev.write_at(0, &[0xFFu8; 512]).await.unwrap();
        dev.discard(0, 1).await.unwrap();

        let mut read_back = vec![0u8; 512];
        dev.read_at(0, &mut read_back).await.unwrap();
        assert_eq!(read_back, vec![0u8; 512]);
    }

    #[tokio::test]
    async fn fail_writes_after_drops_subsequent_bytes() {
        let dev = InMemoryBlockDevice::new(16);
        dev.fail_writes_after(512);
        dev.write_at(0, &[1u8; 512]).await.unwrap();
        dev.write_at(1, &[2u8; 512]).await.unwrap();

        let mut first = vec![0u8; 512];
        dev.read_at(0, &mut first).await.unwrap();
        assert_eq!(first, vec![1u8; 512]);

        let mut second = vec![0u8; 512];
        dev.read_at(1, &mut second).await.unwrap();
        assert_eq!(second, vec![0u8; 512]);
    }
}
