// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

use crate::errors::{CallerError, Result};

/// Checked reader over a length-prefixed wire frame.
///
/// All multibyte integers on the wire are big-endian. Every read is bounds
/// checked; a frame that runs short yields a typed error instead of a
/// panic.
pub(crate) struct FrameReader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> FrameReader<'a> {
    /// Wrap bytes for parsing.
    pub(crate) fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    /// Take the next `n` bytes.
    pub(crate) fn take_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .offset
            .checked_add(n)
            .ok_or(CallerError::DeserializationFailed)?;
        let slice = self
            .bytes
            .get(self.offset..end)
            .ok_or(CallerError::DeserializationFailed)?;
        self.offset = end;
        Ok(slice)
    }

    /// Parse the next 4 bytes as a big-endian u32.
    pub(crate) fn take_u32(&mut self) -> Result<u32> {
        let slice = self.take_bytes(4)?;
        let fixed: [u8; 4] = slice
            .try_into()
            .map_err(|_| CallerError::DeserializationFailed)?;
        Ok(u32::from_be_bytes(fixed))
    }

    /// Parse a `[u32 len][len bytes]` field.
    pub(crate) fn take_len_prefixed(&mut self) -> Result<&'a [u8]> {
        let len = self.take_u32()? as usize;
        self.take_bytes(len)
    }

    /// Parse the next single byte.
    pub(crate) fn take_u8(&mut self) -> Result<u8> {
        Ok(self.take_bytes(1)?[0])
    }

    /// Error unless the whole frame was consumed.
    pub(crate) fn finish(self) -> Result<()> {
        if self.offset != self.bytes.len() {
            Err(CallerError::DeserializationFailed)?;
        }
        Ok(())
    }
}

/// Append a `[u32 len][bytes]` field to a frame under construction.
pub(crate) fn put_len_prefixed(frame: &mut Vec<u8>, bytes: &[u8]) {
    frame.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    frame.extend_from_slice(bytes);
}

////////////////////////////
// Test Utility Functions //
////////////////////////////

/// Returns an rng to be used for testing. This will print the rng seed
/// to stderr so that if a test fails, the failing seed can be recovered
/// and used for debugging.
#[cfg(test)]
pub(crate) mod testing {
    use rand::{
        rngs::{OsRng, StdRng},
        Rng, SeedableRng,
    };

    /// Initialize any fields necessary for our tests. This should be called
    /// at the top of all our tests. This function is idempotent.
    pub(crate) fn init_testing() -> StdRng {
        let mut seeder = OsRng;
        let seed = seeder.gen();
        eprintln!(
            "To re-run test with the same randomness, use init_testing_with_seed() with the following seed:"
        );
        eprintln!("\t{seed:?}");
        StdRng::from_seed(seed)
    }

    /// A seeded version of [`init_testing`]. Use when a test fails
    /// unexpectedly and you want to reproduce the run with a specific RNG
    /// seed.
    ///
    /// **Additionally, turns on logging by default.**
    #[allow(unused)]
    pub(crate) fn init_testing_with_seed(seed: [u8; 32]) -> StdRng {
        use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

        let stdout_layer = tracing_subscriber::fmt::layer().pretty();

        // It's okay if this fails. It just means logging has already been
        // set up for this thread.
        let _ = tracing_subscriber::registry()
            .with(stdout_layer)
            .with(EnvFilter::from_default_env())
            .try_init();

        StdRng::from_seed(seed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_reader_consumes_in_order() {
        let mut frame = Vec::new();
        frame.extend_from_slice(&7u32.to_be_bytes());
        put_len_prefixed(&mut frame, b"abc");
        frame.push(0x2a);

        let mut reader = FrameReader::new(&frame);
        assert_eq!(reader.take_u32().unwrap(), 7);
        assert_eq!(reader.take_len_prefixed().unwrap(), b"abc");
        assert_eq!(reader.take_u8().unwrap(), 0x2a);
        assert!(reader.finish().is_ok());
    }

    #[test]
    fn frame_reader_rejects_short_frames() {
        let mut frame = Vec::new();
        put_len_prefixed(&mut frame, b"abcdef");
        frame.truncate(frame.len() - 1);

        let mut reader = FrameReader::new(&frame);
        assert!(reader.take_len_prefixed().is_err());
    }

    #[test]
    fn frame_reader_rejects_trailing_bytes() {
        let frame = [0u8, 0, 0, 1, 0xff, 0xee];
        let mut reader = FrameReader::new(&frame);
        let _ = reader.take_len_prefixed().unwrap();
        assert!(reader.finish().is_err());
    }
}
