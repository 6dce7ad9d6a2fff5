//! Record reader for child process output.
//!
//! yt-dlp redraws its progress line with carriage returns (`\r`) unless told
//! otherwise, so a plain `lines()` reader would only see those updates once a
//! `\n` eventually arrives. This reader yields a record on either delimiter.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, BufReader};

/// Longest record kept in full; anything past it is dropped until the next delimiter.
pub const MAX_RECORD_BYTES: usize = 64 * 1024;

/// Reads an async stream and yields text records delimited by `\n` or `\r`.
///
/// Invalid UTF-8 is replaced rather than rejected, so one garbled line never
/// ends the stream.
pub struct OutputRecordReader<R> {
    reader: BufReader<R>,
    pending: Vec<u8>,
    scratch: [u8; 4096],
    overflowed: bool,
}

impl<R> OutputRecordReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            pending: Vec::new(),
            scratch: [0u8; 4096],
            overflowed: false,
        }
    }

    /// Returns the next non-empty record, or `None` at end of stream.
    pub async fn next_record(&mut self) -> io::Result<Option<String>> {
        loop {
            if let Some(idx) = self.pending.iter().position(|&b| is_delimiter(b)) {
                let record_bytes: Vec<u8> = self.pending.drain(..idx).collect();
                let delimiters = self
                    .pending
                    .iter()
                    .take_while(|&&b| is_delimiter(b))
                    .count();
                self.pending.drain(..delimiters);
                self.overflowed = false;

                if let Some(record) = to_record(&record_bytes) {
                    return Ok(Some(record));
                }
                continue;
            }

            let n = self.reader.read(&mut self.scratch).await?;
            if n == 0 {
                let record = to_record(&self.pending);
                self.pending.clear();
                return Ok(record);
            }

            self.append(n);
        }
    }

    fn append(&mut self, n: usize) {
        let chunk = &self.scratch[..n];
        if !self.overflowed && self.pending.len() + n <= MAX_RECORD_BYTES {
            self.pending.extend_from_slice(chunk);
            return;
        }

        // Keep the head of an oversized record, skip input up to its delimiter.
        match chunk.iter().position(|&b| is_delimiter(b)) {
            Some(idx) if self.overflowed => {
                self.overflowed = false;
                self.pending.extend_from_slice(&chunk[idx..]);
            }
            Some(idx) => {
                let room = MAX_RECORD_BYTES.saturating_sub(self.pending.len());
                self.pending.extend_from_slice(&chunk[..idx.min(room)]);
                self.pending.extend_from_slice(&chunk[idx..]);
            }
            None => {
                let room = MAX_RECORD_BYTES.saturating_sub(self.pending.len());
                self.pending.extend_from_slice(&chunk[..room.min(n)]);
                self.overflowed = true;
            }
        }
    }
}

fn is_delimiter(b: u8) -> bool {
    matches!(b, b'\n' | b'\r')
}

fn to_record(bytes: &[u8]) -> Option<String> {
    let record = String::from_utf8_lossy(bytes).trim().to_string();
    (!record.is_empty()).then_some(record)
}
