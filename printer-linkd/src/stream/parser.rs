use bytes::{Buf, Bytes, BytesMut};
use crate::error::{LinkError, Result};

/// Extract the part delimiter from a `multipart/*` content type.
///
/// The boundary parameter may be quoted and may already carry the leading
/// `--`; the returned delimiter always starts with exactly one `--`.
pub fn boundary_from_content_type(content_type: &str) -> Result<Vec<u8>> {
    let mut params = content_type.split(';').map(str::trim);

    let mime = params.next().unwrap_or_default();
    if !mime.to_ascii_lowercase().starts_with("multipart/") {
        return Err(LinkError::InvalidStreamHeader(format!(
            "not a multipart content type: {}",
            content_type
        )));
    }

    let boundary = params
        .find_map(|p| {
            let (key, value) = p.split_once('=')?;
            key.trim().eq_ignore_ascii_case("boundary").then(|| value.trim())
        })
        .ok_or_else(|| LinkError::InvalidStreamHeader(format!("no boundary in {}", content_type)))?;

    let boundary = boundary.trim_matches('"');
    let boundary = boundary.strip_prefix("--").unwrap_or(boundary);
    if boundary.is_empty() {
        return Err(LinkError::InvalidStreamHeader(format!("empty boundary in {}", content_type)));
    }

    Ok(format!("--{}", boundary).into_bytes())
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from >= haystack.len() || needle.is_empty() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}

/// Splits a multipart byte stream into parts.
///
/// Bytes are pushed as they arrive. A part is everything before a boundary
/// that is followed by its header block; the boundary and headers are dropped
/// with the part. Scanning resumes where the last unsuccessful search left
/// off, keeping enough bytes to match a boundary split across pushes.
pub struct MultipartParser {
    boundary: Vec<u8>,
    buffer: BytesMut,
    search_offset: usize,
    limit: usize,
}

impl MultipartParser {
    pub fn new(boundary: Vec<u8>, limit: usize) -> Self {
        Self {
            boundary,
            buffer: BytesMut::with_capacity(64 * 1024),
            search_offset: 0,
            limit,
        }
    }

    /// Append a chunk. Fails without buffering it if the accumulator would
    /// grow past its limit.
    pub fn push(&mut self, chunk: &[u8]) -> Result<()> {
        let size = self.buffer.len() + chunk.len();
        if size > self.limit {
            return Err(LinkError::BufferOverflow {
                size,
                limit: self.limit,
                dump: None,
            });
        }
        self.buffer.extend_from_slice(chunk);
        Ok(())
    }

    /// The next complete part, if the buffer holds one. Parts may be empty.
    pub fn next_part(&mut self) -> Option<Bytes> {
        let start = match find(&self.buffer, &self.boundary, self.search_offset) {
            Some(start) => start,
            None => {
                self.search_offset = self.buffer.len().saturating_sub(self.boundary.len());
                return None;
            }
        };

        let headers_from = start + self.boundary.len();
        let end = [&b"\r\n\r\n"[..], &b"\n\n"[..]]
            .iter()
            .filter_map(|sep| find(&self.buffer, sep, headers_from).map(|at| at + sep.len()))
            .min();

        let Some(end) = end else {
            // Header block incomplete, the boundary itself is already found
            self.search_offset = start;
            return None;
        };

        let part = self.buffer.split_to(start).freeze();
        self.buffer.advance(end - start);
        self.search_offset = 0;
        Some(part)
    }

    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parts(parser: &mut MultipartParser) -> Vec<Bytes> {
        std::iter::from_fn(|| parser.next_part()).collect()
    }

    #[test]
    fn test_boundary_plain() {
        let boundary = boundary_from_content_type("multipart/x-mixed-replace;boundary=frame").unwrap();
        assert_eq!(boundary, b"--frame");
    }

    #[test]
    fn test_boundary_quoted_and_prefixed() {
        let boundary =
            boundary_from_content_type("multipart/x-mixed-replace; boundary=\"--boundarydonotcross\"")
                .unwrap();
        assert_eq!(boundary, b"--boundarydonotcross");
    }

    #[test]
    fn test_boundary_extra_params() {
        let boundary = boundary_from_content_type(
            "Multipart/X-Mixed-Replace; charset=utf-8; Boundary=abc123",
        )
        .unwrap();
        assert_eq!(boundary, b"--abc123");
    }

    #[test]
    fn test_boundary_rejects_other_types() {
        assert!(matches!(
            boundary_from_content_type("text/html; boundary=frame"),
            Err(LinkError::InvalidStreamHeader(_))
        ));
        assert!(matches!(
            boundary_from_content_type("multipart/x-mixed-replace"),
            Err(LinkError::InvalidStreamHeader(_))
        ));
        assert!(matches!(
            boundary_from_content_type("multipart/x-mixed-replace; boundary=\"\""),
            Err(LinkError::InvalidStreamHeader(_))
        ));
    }

    #[test]
    fn test_two_frames_in_one_buffer() {
        let mut parser = MultipartParser::new(b"--b".to_vec(), 1024);
        parser
            .push(b"--b\r\n\r\nJPEG1--b\r\n\r\nJPEG2--b\r\n\r\n")
            .unwrap();

        let frames: Vec<_> = parts(&mut parser).into_iter().filter(|p| !p.is_empty()).collect();
        assert_eq!(frames, vec![Bytes::from_static(b"JPEG1"), Bytes::from_static(b"JPEG2")]);
        assert!(parser.is_empty());
    }

    #[test]
    fn test_headers_are_dropped() {
        let mut parser = MultipartParser::new(b"--frame".to_vec(), 1024);
        parser
            .push(b"--frame\r\nContent-Type: image/jpeg\r\nContent-Length: 4\r\n\r\nDATA\r\n--frame\r\nContent-Type: image/jpeg\r\n\r\n")
            .unwrap();

        assert_eq!(parser.next_part().unwrap().len(), 0);
        assert_eq!(parser.next_part().unwrap(), Bytes::from_static(b"DATA\r\n"));
        assert!(parser.next_part().is_none());
    }

    #[test]
    fn test_boundary_split_across_pushes() {
        let mut parser = MultipartParser::new(b"--boundary".to_vec(), 1024);
        parser.push(b"--boundary\n\nFIRST-FRAME--bou").unwrap();
        assert_eq!(parser.next_part().unwrap().len(), 0);
        assert!(parser.next_part().is_none());

        parser.push(b"ndary\n").unwrap();
        assert!(parser.next_part().is_none());

        parser.push(b"\nNEXT").unwrap();
        assert_eq!(parser.next_part().unwrap(), Bytes::from_static(b"FIRST-FRAME"));
        assert_eq!(parser.buffered(), b"NEXT");
    }

    #[test]
    fn test_search_offset_keeps_boundary_tail() {
        let mut parser = MultipartParser::new(b"--b".to_vec(), 1024);
        parser.push(b"xxxxxxxxxx-").unwrap();
        assert!(parser.next_part().is_none());
        parser.push(b"-b\r\n\r\n").unwrap();
        assert_eq!(parser.next_part().unwrap(), Bytes::from_static(b"xxxxxxxxxx"));
    }

    #[test]
    fn test_overflow() {
        let mut parser = MultipartParser::new(b"--b".to_vec(), 8);
        parser.push(b"12345").unwrap();
        match parser.push(b"6789") {
            Err(LinkError::BufferOverflow { size, limit, dump }) => {
                assert_eq!(size, 9);
                assert_eq!(limit, 8);
                assert!(dump.is_none());
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(parser.len(), 5);
    }
}
