//! Output Collector
//!
//! Streams child output into a bounded buffer. Once the cap is reached the
//! remaining output is read and discarded so the child is never blocked on
//! a full pipe and never killed just for being chatty.

use tokio::io::{AsyncRead, AsyncReadExt};

/// Captured bytes from one stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectedOutput {
    /// Up to `cap` bytes of output
    pub bytes: Vec<u8>,

    /// Whether output beyond the cap was discarded
    pub truncated: bool,
}

impl CollectedOutput {
    /// Decode permissively; invalid sequences become replacement
    /// characters, never a fault.
    pub fn into_string(self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

/// Read a stream to EOF, keeping at most `cap` bytes.
///
/// The stream is always drained to EOF even after the cap is hit, so the
/// writing process can run to natural completion or timeout.
pub async fn collect_capped<R>(mut reader: R, cap: usize) -> std::io::Result<CollectedOutput>
where
    R: AsyncRead + Unpin,
{
    let mut bytes = Vec::new();
    let mut truncated = false;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }

        if bytes.len() < cap {
            let take = n.min(cap - bytes.len());
            bytes.extend_from_slice(&chunk[..take]);
            if take < n {
                truncated = true;
            }
        } else {
            // Past the cap: keep draining, discard everything.
            truncated = true;
        }
    }

    Ok(CollectedOutput { bytes, truncated })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_collect_under_cap() {
        let data: &[u8] = b"hello world\n";
        let out = collect_capped(data, 1024).await.unwrap();
        assert_eq!(out.bytes, b"hello world\n");
        assert!(!out.truncated);
    }

    #[tokio::test]
    async fn test_collect_exactly_at_cap() {
        let data: &[u8] = b"12345";
        let out = collect_capped(data, 5).await.unwrap();
        assert_eq!(out.bytes, b"12345");
        assert!(!out.truncated);
    }

    #[tokio::test]
    async fn test_collect_over_cap_truncates_at_cap() {
        let data = vec![b'x'; 10_000];
        let out = collect_capped(data.as_slice(), 100).await.unwrap();
        assert_eq!(out.bytes.len(), 100);
        assert!(out.truncated);
    }

    #[tokio::test]
    async fn test_collect_empty_stream() {
        let data: &[u8] = b"";
        let out = collect_capped(data, 100).await.unwrap();
        assert!(out.bytes.is_empty());
        assert!(!out.truncated);
    }

    #[tokio::test]
    async fn test_cap_boundary_inside_chunk() {
        // 8192-byte read chunks; cap inside the second chunk
        let data = vec![b'a'; 9000];
        let out = collect_capped(data.as_slice(), 8500).await.unwrap();
        assert_eq!(out.bytes.len(), 8500);
        assert!(out.truncated);
    }

    #[tokio::test]
    async fn test_invalid_utf8_decodes_lossily() {
        let data: &[u8] = &[b'o', b'k', 0xFF, 0xFE, b'!'];
        let out = collect_capped(data, 100).await.unwrap();
        let s = out.into_string();
        assert!(s.starts_with("ok"));
        assert!(s.ends_with('!'));
        assert!(s.contains('\u{FFFD}'));
    }

    #[tokio::test]
    async fn test_zero_cap_discards_everything() {
        let data: &[u8] = b"anything";
        let out = collect_capped(data, 0).await.unwrap();
        assert!(out.bytes.is_empty());
        assert!(out.truncated);
    }
}
