//! Fixed-size block splitting

use tokio::io::{AsyncRead, AsyncReadExt};

/// Default block size (50 MiB)
pub const DEFAULT_BLOCK_SIZE: usize = 50 * 1024 * 1024;

/// Reads a stream as consecutive blocks of exactly `block_size` bytes.
///
/// Short reads from the underlying source are retried until the block is full,
/// so only the final block of a stream can be shorter than `block_size`.
pub struct BlockReader<R> {
    reader: R,
    block_size: usize,
    finished: bool,
}

impl<R: AsyncRead + Unpin> BlockReader<R> {
    pub fn new(reader: R, block_size: usize) -> Self {
        assert!(block_size > 0, "block size must be non-zero");
        Self {
            reader,
            block_size,
            finished: false,
        }
    }

    /// Read the next block, or `None` at end of stream
    pub async fn next_block(&mut self) -> std::io::Result<Option<Vec<u8>>> {
        if self.finished {
            return Ok(None);
        }

        let mut buffer = vec![0u8; self.block_size];
        let mut filled = 0;
        while filled < self.block_size {
            let bytes_read = self.reader.read(&mut buffer[filled..]).await?;
            if bytes_read == 0 {
                self.finished = true;
                break;
            }
            filled += bytes_read;
        }

        if filled == 0 {
            return Ok(None);
        }
        buffer.truncate(filled);
        Ok(Some(buffer))
    }
}

/// Number of blocks a stream of `len` bytes splits into
pub fn block_count(len: u64, block_size: usize) -> u64 {
    len.div_ceil(block_size as u64)
}
