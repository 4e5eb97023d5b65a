use super::ObjectHead;
use crate::utils::basename;
use axum::body::Body;
use axum::response::Response;
use bytes::Bytes;
use futures::stream::{self, Stream};
use http::header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE};
use http::StatusCode;
use std::io;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncReadExt};

pub const FALLBACK_CONTENT_TYPE: &str = "application/octet-stream";

/// Lazy, finite, non-restartable sequence of object chunks.
pub type ChunkStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// Split a reader into chunks of exactly `chunk_size` bytes (the last may be
/// shorter). The reader is dropped as soon as it is exhausted, fails, or the
/// stream itself is dropped.
pub fn chunk_stream(
    reader: Pin<Box<dyn AsyncRead + Send>>,
    chunk_size: usize,
) -> impl Stream<Item = io::Result<Bytes>> + Send + 'static {
    let chunk_size = chunk_size.max(1);

    stream::unfold(Some(reader), move |state| async move {
        let mut reader = state?;
        let mut buf = vec![0u8; chunk_size];
        let mut filled = 0;

        while filled < chunk_size {
            match reader.read(&mut buf[filled..]).await {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) => return Some((Err(e), None)),
            }
        }

        if filled == 0 {
            return None;
        }

        buf.truncate(filled);
        let next = (filled == chunk_size).then_some(reader);
        Some((Ok(Bytes::from(buf)), next))
    })
}

/// Content type from the file extension, then the store's recorded type.
pub fn content_type_for(name: &str, recorded: Option<&str>) -> String {
    mime_guess::from_path(name)
        .first_raw()
        .map(str::to_string)
        .or_else(|| recorded.map(str::to_string))
        .unwrap_or_else(|| FALLBACK_CONTENT_TYPE.to_string())
}

/// Basename with every non-ASCII character replaced by `?`.
pub fn sanitize_download_name(name: &str) -> String {
    basename(name)
        .chars()
        .map(|c| if c.is_ascii() { c } else { '?' })
        .collect()
}

/// `inline; filename*=utf-8''<name>`, or `attachment` for an explicit download.
pub fn content_disposition(name: &str, attachment: bool) -> String {
    let disposition = if attachment { "attachment" } else { "inline" };
    format!(
        "{}; filename*=utf-8''{}",
        disposition,
        urlencoding::encode(&sanitize_download_name(name))
    )
}

/// Frame a streamed object. Content-Length is taken from the store's
/// metadata rather than measured.
pub fn build_stream_response<S>(
    head: &ObjectHead,
    key: &str,
    download_name: Option<&str>,
    body: S,
) -> Result<Response, http::Error>
where
    S: Stream<Item = io::Result<Bytes>> + Send + 'static,
{
    let name = download_name.unwrap_or_else(|| basename(key));

    http::Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, content_type_for(key, head.content_type.as_deref()))
        .header(CONTENT_LENGTH, head.content_length)
        .header(
            CONTENT_DISPOSITION,
            content_disposition(name, download_name.is_some()),
        )
        .body(Body::from_stream(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::io::Cursor;

    async fn collect_chunks(data: Vec<u8>, chunk_size: usize) -> Vec<Bytes> {
        chunk_stream(Box::pin(Cursor::new(data)), chunk_size)
            .map(|c| c.unwrap())
            .collect()
            .await
    }

    #[tokio::test]
    async fn test_chunks_are_fixed_size() {
        let data: Vec<u8> = (0..250u32).map(|i| i as u8).collect();
        let chunks = collect_chunks(data.clone(), 64).await;

        let sizes: Vec<usize> = chunks.iter().map(|c| c.len()).collect();
        assert_eq!(sizes, vec![64, 64, 64, 58]);
        assert_eq!(chunks.concat(), data);
    }

    #[tokio::test]
    async fn test_exact_multiple_has_no_empty_tail() {
        let chunks = collect_chunks(vec![7u8; 128], 64).await;
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.len() == 64));
    }

    #[tokio::test]
    async fn test_empty_object_yields_nothing() {
        assert!(collect_chunks(Vec::new(), 64).await.is_empty());
    }

    #[test]
    fn test_content_type_prefers_extension() {
        assert_eq!(content_type_for("a/b/ab12.jpg", Some("application/x-foo")), "image/jpeg");
        assert_eq!(content_type_for("a/b/ab12.unknownext", Some("image/tiff")), "image/tiff");
        assert_eq!(content_type_for("a/b/noext", None), FALLBACK_CONTENT_TYPE);
    }

    #[test]
    fn test_content_disposition_sanitizes_name() {
        assert_eq!(
            content_disposition("botany/originals/ab/12/ab12 cd.jpg", false),
            "inline; filename*=utf-8''ab12%20cd.jpg"
        );
        assert_eq!(
            content_disposition("fléur.png", true),
            "attachment; filename*=utf-8''fl%3Feur.png"
        );
    }

    #[tokio::test]
    async fn test_stream_response_headers() {
        let head = ObjectHead {
            content_length: 5,
            content_type: Some("image/jpeg".to_string()),
        };
        let body = chunk_stream(Box::pin(Cursor::new(b"hello".to_vec())), 2);
        let response =
            build_stream_response(&head, "botany/originals/ab/12/ab12.jpg", None, body).unwrap();

        let headers = response.headers();
        assert_eq!(headers[CONTENT_TYPE], "image/jpeg");
        assert_eq!(headers[CONTENT_LENGTH], "5");
        assert_eq!(headers[CONTENT_DISPOSITION], "inline; filename*=utf-8''ab12.jpg");

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&bytes[..], b"hello");
    }
}
