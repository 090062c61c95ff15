// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use super::{PieceCid, PieceHasher};
use crate::error::Error;
use bytes::Bytes;
use futures::{Stream, StreamExt};

/// Drain a byte stream while re-computing its piece commitment, returning
/// the fully validated buffer.
///
/// Callers may observe chunks incrementally through `on_chunk`, but the
/// bytes only become trustworthy once this function returns: on a digest
/// mismatch the whole download is rejected with [`Error::DigestMismatch`].
pub async fn collect_validated<S, E>(
    stream: S,
    expected: &PieceCid,
    mut on_chunk: Option<&mut (dyn FnMut(&[u8]) + Send)>,
) -> Result<Vec<u8>, Error>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: std::fmt::Display,
{
    let mut hasher = PieceHasher::new();
    let mut buffer = Vec::new();
    let mut stream = std::pin::pin!(stream);

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| Error::MalformedServerResponse(e.to_string()))?;
        hasher.update(&chunk);
        if let Some(cb) = on_chunk.as_deref_mut() {
            cb(&chunk);
        }
        buffer.extend_from_slice(&chunk);
    }

    let got = hasher.finalize()?;
    if &got != expected {
        return Err(Error::DigestMismatch {
            expected: expected.to_string(),
            got: got.to_string(),
        });
    }
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn ok_chunks(data: &[u8], chunk: usize) -> impl Stream<Item = Result<Bytes, String>> {
        let chunks: Vec<_> = data
            .chunks(chunk)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        stream::iter(chunks)
    }

    #[tokio::test]
    async fn matching_digest_yields_the_full_buffer() {
        let data = vec![7u8; 1000];
        let expected = PieceCid::from_data(&data).unwrap();
        let mut seen = 0usize;
        let mut on_chunk = |c: &[u8]| seen += c.len();
        let out = collect_validated(ok_chunks(&data, 64), &expected, Some(&mut on_chunk))
            .await
            .unwrap();
        assert_eq!(out, data);
        assert_eq!(seen, data.len());
    }

    #[tokio::test]
    async fn corrupted_stream_is_rejected() {
        let data = vec![7u8; 1000];
        let expected = PieceCid::from_data(&data).unwrap();
        let mut corrupted = data.clone();
        corrupted[500] ^= 1;
        let err = collect_validated(ok_chunks(&corrupted, 64), &expected, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DigestMismatch { .. }));
    }

    #[tokio::test]
    async fn transport_errors_propagate() {
        let chunks: Vec<Result<Bytes, String>> = vec![
            Ok(Bytes::from_static(b"abc")),
            Err("connection reset".to_string()),
        ];
        let expected = PieceCid::from_data(b"abc").unwrap();
        let err = collect_validated(stream::iter(chunks), &expected, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MalformedServerResponse(_)));
    }
}
