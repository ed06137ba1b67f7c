//! Content-type detection from magic bytes
//!
//! The sniffer reads just enough of a stream to decide, compares the prefix
//! against an ordered signature table and drops the stream as soon as a
//! decision is reached. Unknown or short input resolves to
//! `application/octet-stream`.

use futures::StreamExt;

use crate::config::SignatureConfig;
use crate::error::{ConfigError, Result};
use crate::storage::ChunkStream;

/// Media type used when nothing matches
pub const OCTET_STREAM: &str = "application/octet-stream";

/// Prefix length read when the table holds only short signatures
const MIN_PREFIX_LEN: usize = 16;

/// A detected media type with the extension used for destination keys
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaType {
    pub essence: String,
    pub extension: Option<String>,
}

impl MediaType {
    pub fn octet_stream() -> Self {
        Self {
            essence: OCTET_STREAM.to_string(),
            extension: None,
        }
    }

    pub fn is_fallback(&self) -> bool {
        self.essence == OCTET_STREAM
    }
}

/// One byte signature
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub offset: usize,
    pub magic: Vec<u8>,
    pub media_type: MediaType,
}

impl Signature {
    pub fn new(offset: usize, magic: &[u8], essence: &str, extension: &str) -> Self {
        Self {
            offset,
            magic: magic.to_vec(),
            media_type: MediaType {
                essence: essence.to_string(),
                extension: Some(extension.to_string()),
            },
        }
    }

    fn end(&self) -> usize {
        self.offset + self.magic.len()
    }

    fn matches(&self, prefix: &[u8]) -> Match {
        if prefix.len() >= self.end() {
            if prefix[self.offset..self.end()] == self.magic[..] {
                Match::Full
            } else {
                Match::No
            }
        } else if prefix.len() <= self.offset {
            Match::Pending
        } else {
            let seen = prefix.len() - self.offset;
            if prefix[self.offset..] == self.magic[..seen] {
                Match::Pending
            } else {
                Match::No
            }
        }
    }
}

enum Match {
    Full,
    Pending,
    No,
}

/// Ordered table of signatures; first match wins
#[derive(Debug, Clone)]
pub struct SignatureTable {
    entries: Vec<Signature>,
}

impl Default for SignatureTable {
    fn default() -> Self {
        Self::builtin()
    }
}

impl SignatureTable {
    /// Built-in signatures for common document, image, archive and media formats
    pub fn builtin() -> Self {
        Self {
            entries: vec![
                Signature::new(0, b"%PDF", "application/pdf", "pdf"),
                Signature::new(0, &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A], "image/png", "png"),
                Signature::new(0, &[0xFF, 0xD8, 0xFF], "image/jpeg", "jpeg"),
                Signature::new(0, b"GIF8", "image/gif", "gif"),
                Signature::new(0, &[0x50, 0x4B, 0x03, 0x04], "application/zip", "zip"),
                Signature::new(0, &[0x1F, 0x8B, 0x08], "application/gzip", "gz"),
                Signature::new(0, &[0x49, 0x49, 0x2A, 0x00], "image/tiff", "tiff"),
                Signature::new(0, &[0x4D, 0x4D, 0x00, 0x2A], "image/tiff", "tiff"),
                Signature::new(0, b"OggS", "audio/ogg", "ogg"),
                Signature::new(0, b"fLaC", "audio/flac", "flac"),
                Signature::new(0, b"ID3", "audio/mpeg", "mp3"),
                Signature::new(0, &[0x1A, 0x45, 0xDF, 0xA3], "video/webm", "webm"),
                // ISO-BMFF: box size in bytes 0..4, then `ftyp`
                Signature::new(4, b"ftyp", "video/mp4", "mp4"),
            ],
        }
    }

    /// Built-in table followed by configured signatures
    pub fn with_extra(extra: &[SignatureConfig]) -> Result<Self> {
        let mut table = Self::builtin();
        for entry in extra {
            let magic = hex::decode(&entry.hex).map_err(|_| ConfigError::InvalidValue {
                field: "sniffer.extra_signatures.hex".to_string(),
                value: entry.hex.clone(),
            })?;
            table.push(Signature {
                offset: entry.offset,
                magic,
                media_type: MediaType {
                    essence: entry.media_type.clone(),
                    extension: entry.extension.clone(),
                },
            });
        }
        Ok(table)
    }

    pub fn push(&mut self, signature: Signature) {
        self.entries.push(signature);
    }

    /// Number of bytes needed to decide on any entry
    pub fn prefix_len(&self) -> usize {
        self.entries
            .iter()
            .map(Signature::end)
            .max()
            .unwrap_or(0)
            .max(MIN_PREFIX_LEN)
    }

    /// Decide on a prefix, or `None` if more bytes could change the answer
    ///
    /// `complete` marks the prefix as the whole input.
    pub fn decide(&self, prefix: &[u8], complete: bool) -> Option<MediaType> {
        for entry in &self.entries {
            match entry.matches(prefix) {
                Match::Full => return Some(entry.media_type.clone()),
                Match::Pending if !complete => return None,
                _ => {}
            }
        }
        if complete || prefix.len() >= self.prefix_len() {
            Some(MediaType::octet_stream())
        } else {
            None
        }
    }

    /// Classify a complete byte prefix
    pub fn classify(&self, prefix: &[u8]) -> MediaType {
        let bound = prefix.len().min(self.prefix_len());
        self.decide(&prefix[..bound], true)
            .unwrap_or_else(MediaType::octet_stream)
    }
}

/// Sniff the media type of a stream
///
/// Never fails: read errors resolve to the generic fallback. The stream is
/// dropped as soon as a decision is reached.
pub async fn sniff(table: &SignatureTable, mut stream: ChunkStream) -> MediaType {
    let prefix_len = table.prefix_len();
    let mut prefix: Vec<u8> = Vec::with_capacity(prefix_len);

    loop {
        match stream.next().await {
            Some(Ok(chunk)) => {
                let take = (prefix_len - prefix.len()).min(chunk.len());
                prefix.extend_from_slice(&chunk[..take]);
                if let Some(media_type) = table.decide(&prefix, false) {
                    drop(stream);
                    return media_type;
                }
            }
            Some(Err(e)) => {
                tracing::debug!(error = %e, "Sniff read failed, using fallback type");
                return MediaType::octet_stream();
            }
            None => return table.decide(&prefix, true).unwrap_or_else(MediaType::octet_stream),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures::stream;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn chunks(parts: Vec<&'static [u8]>) -> ChunkStream {
        stream::iter(parts.into_iter().map(|p| Ok(Bytes::from_static(p)))).boxed()
    }

    #[test]
    fn test_builtin_signatures() {
        let table = SignatureTable::builtin();
        assert_eq!(table.classify(b"%PDF-1.7\n").essence, "application/pdf");
        assert_eq!(
            table.classify(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0]).essence,
            "image/png"
        );
        assert_eq!(table.classify(&[0xFF, 0xD8, 0xFF, 0xE0]).essence, "image/jpeg");
        assert_eq!(table.classify(b"GIF89a").essence, "image/gif");
        assert_eq!(table.classify(&[0x50, 0x4B, 0x03, 0x04, 0x14]).essence, "application/zip");
        assert_eq!(
            table.classify(&[0, 0, 0, 0x18, b'f', b't', b'y', b'p', b'm', b'p', b'4', b'2']).essence,
            "video/mp4"
        );
    }

    #[test]
    fn test_extension_hint() {
        let table = SignatureTable::builtin();
        assert_eq!(table.classify(b"%PDF").extension.as_deref(), Some("pdf"));
        assert!(table.classify(b"plain text").extension.is_none());
    }

    #[test]
    fn test_short_input_falls_back() {
        let table = SignatureTable::builtin();
        assert!(table.classify(b"").is_fallback());
        assert!(table.classify(&[0xFF, 0xD8]).is_fallback());
        assert!(table.classify(b"%PD").is_fallback());
    }

    #[test]
    fn test_classify_is_pure() {
        let table = SignatureTable::builtin();
        let input = b"GIF87a....";
        assert_eq!(table.classify(input), table.classify(input));
    }

    #[test]
    fn test_pending_prefix_defers_decision() {
        let table = SignatureTable::builtin();
        assert!(table.decide(&[0x89, b'P'], false).is_none());
        assert!(table.decide(b"hello world, this is text", false).is_some());
    }

    #[test]
    fn test_extra_signatures_are_appended() {
        let table = SignatureTable::with_extra(&[SignatureConfig {
            hex: "52617221".to_string(),
            offset: 0,
            media_type: "application/vnd.rar".to_string(),
            extension: Some("rar".to_string()),
        }])
        .unwrap();
        let media = table.classify(b"Rar!\x1a\x07");
        assert_eq!(media.essence, "application/vnd.rar");
        assert_eq!(media.extension.as_deref(), Some("rar"));
    }

    #[test]
    fn test_prefix_len_tracks_longest_signature() {
        let mut table = SignatureTable::builtin();
        assert_eq!(table.prefix_len(), MIN_PREFIX_LEN);
        table.push(Signature::new(30, b"mimetypeapplication/epub", "application/epub+zip", "epub"));
        assert_eq!(table.prefix_len(), 54);
    }

    #[tokio::test]
    async fn test_sniff_across_chunks() {
        let table = SignatureTable::builtin();
        let parts: Vec<&'static [u8]> = vec![&b"\x89P"[..], &b"NG\r"[..], &b"\n\x1a\n"[..]];
        let media = sniff(&table, chunks(parts)).await;
        assert_eq!(media.essence, "image/png");
    }

    #[tokio::test]
    async fn test_sniff_short_stream() {
        let table = SignatureTable::builtin();
        assert!(sniff(&table, chunks(vec![&b"%P"[..]])).await.is_fallback());
        assert!(sniff(&table, chunks(vec![])).await.is_fallback());
    }

    #[tokio::test]
    async fn test_sniff_read_error_falls_back() {
        let table = SignatureTable::builtin();
        let failing: ChunkStream = stream::iter(vec![Err(std::io::Error::other("reset"))]).boxed();
        assert!(sniff(&table, failing).await.is_fallback());
    }

    #[tokio::test]
    async fn test_sniff_stops_reading_after_decision() {
        let pulled = Arc::new(AtomicUsize::new(0));
        let counter = pulled.clone();
        let endless: ChunkStream = stream::repeat_with(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Bytes::from_static(b"%PDF-1.4 lots of content"))
        })
        .boxed();
        let media = sniff(&SignatureTable::builtin(), endless).await;
        assert_eq!(media.essence, "application/pdf");
        assert_eq!(pulled.load(Ordering::SeqCst), 1);
    }
}
