//! Webseed downloads ([BEP-19]).
//!
//! A webseed source serves the torrent's content over plain HTTP. The
//! downloader fetches the byte span of its assigned piece run with Range
//! requests, cuts the stream at piece boundaries, verifies each piece, and
//! hands verified pieces to the controller. It re-reads its range end
//! under the shared registry lock at every piece boundary, because the
//! picker may shrink the run to feed another source.
//!
//! [BEP-19]: http://bittorrent.org/beps/bep_0019.html

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use parking_lot::Mutex;
use reqwest::{header, Client, StatusCode};
use sha1::{Digest, Sha1};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::debug;

use crate::metainfo::Info;
use crate::picker::{WebseedRanges, WebseedSpec};
use crate::pool::PiecePool;

#[derive(Debug, Error)]
pub enum WebseedError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("http status {0}")]
    Status(StatusCode),

    #[error("body read timed out")]
    BodyTimeout,

    #[error("piece {0} hash mismatch")]
    HashMismatch(u32),

    #[error("server sent a short body")]
    ShortBody,
}

/// Results on the controller's webseed channel.
#[derive(Debug)]
pub enum WebseedMessage {
    /// A hash-verified piece. The controller writes it to storage.
    Piece {
        url: String,
        index: u32,
        data: BytesMut,
    },
    /// The assigned range is exhausted.
    Done { url: String },
    /// The source failed; the controller disables it and records the error.
    Failed { url: String, error: WebseedError },
}

/// Starts a webseed download for `spec`.
#[allow(clippy::too_many_arguments)]
pub fn spawn(
    client: Client,
    spec: WebseedSpec,
    info: Arc<Info>,
    ranges: Arc<Mutex<WebseedRanges>>,
    pool: Arc<PiecePool>,
    body_read_timeout: Duration,
    result_tx: mpsc::Sender<WebseedMessage>,
    stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let url = spec.url.clone();
        let outcome = run(
            client,
            spec,
            info,
            ranges,
            pool,
            body_read_timeout,
            &result_tx,
            stop,
        )
        .await;
        let message = match outcome {
            Ok(()) => WebseedMessage::Done { url },
            Err(error) => {
                debug!(%url, %error, "webseed download failed");
                WebseedMessage::Failed { url, error }
            }
        };
        let _ = result_tx.send(message).await;
    })
}

#[allow(clippy::too_many_arguments)]
async fn run(
    client: Client,
    spec: WebseedSpec,
    info: Arc<Info>,
    ranges: Arc<Mutex<WebseedRanges>>,
    pool: Arc<PiecePool>,
    body_read_timeout: Duration,
    result_tx: &mpsc::Sender<WebseedMessage>,
    mut stop: watch::Receiver<bool>,
) -> Result<(), WebseedError> {
    let mut assembler = PieceAssembler::new(&info, &pool, spec.begin);
    let mut current = spec.begin;

    'pieces: while current < ranges.lock().end_of(&spec.url).unwrap_or(current) {
        // One request per file the remaining span crosses. The span is
        // recomputed each round because the end may have shrunk.
        let span_start = info.piece_offset(current);
        let span_end = range_byte_end(&info, &ranges, &spec.url);
        if span_start >= span_end {
            break;
        }

        for file in files_in_span(&info, span_start, span_end) {
            let file_url = file_url(&spec.url, &info, file);
            let from = span_start.max(file.offset) - file.offset;
            let to = span_end.min(file.offset + file.length) - file.offset; // exclusive
            let response = client
                .get(&file_url)
                .header(header::RANGE, format!("bytes={}-{}", from, to - 1))
                .send()
                .await?;
            if !matches!(response.status(), StatusCode::OK | StatusCode::PARTIAL_CONTENT) {
                return Err(WebseedError::Status(response.status()));
            }

            let mut response = response;
            let mut expected = to - from;
            while expected > 0 {
                let chunk = tokio::select! {
                    chunk = timeout(body_read_timeout, response.chunk()) => {
                        match chunk {
                            Ok(Ok(Some(chunk))) => chunk,
                            Ok(Ok(None)) => return Err(WebseedError::ShortBody),
                            Ok(Err(err)) => return Err(err.into()),
                            Err(_) => return Err(WebseedError::BodyTimeout),
                        }
                    }
                    _ = stop.changed() => return Ok(()),
                };
                let take = (chunk.len() as u64).min(expected) as usize;
                expected -= take as u64;

                for piece in assembler.feed(&chunk[..take]) {
                    let (index, data) = piece?;
                    // progress and the end re-read happen under one lock
                    // so a concurrent split cannot miss either
                    let exhausted = {
                        let mut guard = ranges.lock();
                        guard.advance(&spec.url, index + 1);
                        guard.end_of(&spec.url).is_none_or(|end| index + 1 >= end)
                    };
                    result_tx
                        .send(WebseedMessage::Piece {
                            url: spec.url.clone(),
                            index,
                            data,
                        })
                        .await
                        .ok();
                    current = index + 1;
                    if exhausted {
                        break 'pieces;
                    }
                }
            }
        }
    }
    Ok(())
}

/// Current exclusive byte end of the assigned range.
fn range_byte_end(info: &Info, ranges: &Mutex<WebseedRanges>, url: &str) -> u64 {
    match ranges.lock().end_of(url) {
        Some(end) if end > 0 => {
            info.piece_offset(end - 1) + info.piece_length_at(end - 1) as u64
        }
        _ => 0,
    }
}

fn files_in_span(info: &Info, start: u64, end: u64) -> impl Iterator<Item = &crate::metainfo::FileEntry> {
    info.files
        .iter()
        .filter(move |f| f.length > 0 && f.offset < end && f.offset + f.length > start)
}

/// BEP-19 URL construction: a single-file torrent appends the name only
/// when the base URL ends with a slash; a multi-file torrent always
/// appends the file path (which already starts with the name).
fn file_url(base: &str, info: &Info, file: &crate::metainfo::FileEntry) -> String {
    if !info.multi_file {
        return if base.ends_with('/') {
            format!("{}{}", base, info.name)
        } else {
            base.to_string()
        };
    }
    let mut url = base.strip_suffix('/').unwrap_or(base).to_string();
    for part in file.path.components() {
        url.push('/');
        url.push_str(&part.as_os_str().to_string_lossy());
    }
    url
}

/// Cuts a byte stream into verified piece buffers.
struct PieceAssembler {
    info: Arc<Info>,
    pool: Arc<PiecePool>,
    index: u32,
    buf: BytesMut,
    filled: usize,
}

impl PieceAssembler {
    fn new(info: &Arc<Info>, pool: &Arc<PiecePool>, begin: u32) -> Self {
        let buf = pool.get(info.piece_length_at(begin) as usize);
        Self {
            info: Arc::clone(info),
            pool: Arc::clone(pool),
            index: begin,
            buf,
            filled: 0,
        }
    }

    /// Consumes `data`, yielding each completed and verified piece.
    fn feed<'a>(
        &'a mut self,
        mut data: &'a [u8],
    ) -> impl Iterator<Item = Result<(u32, BytesMut), WebseedError>> + 'a {
        std::iter::from_fn(move || {
            while !data.is_empty() && !self.buf.is_empty() {
                let want = self.buf.len() - self.filled;
                let take = want.min(data.len());
                self.buf[self.filled..self.filled + take].copy_from_slice(&data[..take]);
                self.filled += take;
                data = &data[take..];

                if self.filled == self.buf.len() {
                    let digest: [u8; 20] = Sha1::digest(&self.buf).into();
                    if digest != self.info.piece_hash(self.index) {
                        return Some(Err(WebseedError::HashMismatch(self.index)));
                    }
                    let index = self.index;
                    self.index += 1;
                    let next_len = if self.index < self.info.piece_count() {
                        self.info.piece_length_at(self.index) as usize
                    } else {
                        0
                    };
                    let done = std::mem::replace(&mut self.buf, self.pool.get(next_len));
                    self.filled = 0;
                    return Some(Ok((index, done)));
                }
            }
            None
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::Bitfield;
    use crate::picker::PiecePicker;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// 40 bytes of content: pieces of 16, 16, 8.
    fn content_and_info() -> (Vec<u8>, Info) {
        let content: Vec<u8> = (0u8..40).collect();
        let mut hashes = Vec::new();
        for piece in [&content[..16], &content[16..32], &content[32..]] {
            hashes.extend_from_slice(&Sha1::digest(piece));
        }
        let mut data = Vec::new();
        data.extend_from_slice(b"d6:lengthi40e4:name1:f12:piece lengthi16e6:pieces60:");
        data.extend_from_slice(&hashes);
        data.push(b'e');
        (content, Info::from_bytes(&data).unwrap())
    }

    /// Minimal one-shot HTTP server answering Range requests over `body`.
    async fn serve_ranges(body: Vec<u8>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                let body = body.clone();
                tokio::spawn(async move {
                    let mut req = Vec::new();
                    let mut byte = [0u8; 1];
                    while !req.ends_with(b"\r\n\r\n") {
                        if stream.read_exact(&mut byte).await.is_err() {
                            return;
                        }
                        req.push(byte[0]);
                    }
                    let req = String::from_utf8_lossy(&req);
                    let range = req
                        .lines()
                        .find_map(|l| l.strip_prefix("Range: bytes="))
                        .and_then(|r| {
                            let (a, b) = r.trim().split_once('-')?;
                            Some((a.parse::<usize>().ok()?, b.parse::<usize>().ok()?))
                        });
                    let (from, to) = range.unwrap_or((0, body.len() - 1));
                    let slice = &body[from..=to.min(body.len() - 1)];
                    let head = format!(
                        "HTTP/1.1 206 Partial Content\r\nContent-Length: {}\r\nContent-Range: bytes {}-{}/{}\r\n\r\n",
                        slice.len(),
                        from,
                        to,
                        body.len()
                    );
                    let _ = stream.write_all(head.as_bytes()).await;
                    let _ = stream.write_all(slice).await;
                });
            }
        });
        format!("http://{}/f", addr)
    }

    #[tokio::test]
    async fn downloads_and_verifies_piece_run() {
        let (content, info) = content_and_info();
        let url = serve_ranges(content).await;

        let mut picker = PiecePicker::with_seed(&Bitfield::new(3), 1);
        let spec = picker.pick_webseed(&url, 1).unwrap();
        assert_eq!((spec.begin, spec.end), (0, 3));

        let (tx, mut rx) = mpsc::channel(8);
        let (_stop_tx, stop_rx) = watch::channel(false);
        spawn(
            Client::new(),
            spec,
            Arc::new(info),
            picker.webseed_ranges(),
            Arc::new(PiecePool::new()),
            Duration::from_secs(5),
            tx,
            stop_rx,
        );

        let mut got = Vec::new();
        loop {
            match rx.recv().await.unwrap() {
                WebseedMessage::Piece { index, data, .. } => got.push((index, data.to_vec())),
                WebseedMessage::Done { url: done_url } => {
                    assert_eq!(done_url, url);
                    break;
                }
                WebseedMessage::Failed { error, .. } => panic!("failed: {}", error),
            }
        }
        assert_eq!(got.len(), 3);
        assert_eq!(got[0].0, 0);
        assert_eq!(got[2].1, (32u8..40).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn corrupt_body_fails_with_hash_mismatch() {
        let (mut content, info) = content_and_info();
        content[5] ^= 0xff;
        let url = serve_ranges(content).await;

        let mut picker = PiecePicker::with_seed(&Bitfield::new(3), 1);
        let spec = picker.pick_webseed(&url, 1).unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        let (_stop_tx, stop_rx) = watch::channel(false);
        spawn(
            Client::new(),
            spec,
            Arc::new(info),
            picker.webseed_ranges(),
            Arc::new(PiecePool::new()),
            Duration::from_secs(5),
            tx,
            stop_rx,
        );

        assert!(matches!(
            rx.recv().await.unwrap(),
            WebseedMessage::Failed {
                error: WebseedError::HashMismatch(0),
                ..
            }
        ));
    }

    #[test]
    fn url_construction() {
        let (_, info) = content_and_info();
        // single file: trailing slash appends the name
        let file = &info.files[0];
        assert_eq!(
            file_url("http://seed.example/data/", &info, file),
            "http://seed.example/data/f"
        );
        assert_eq!(
            file_url("http://seed.example/data/f.bin", &info, file),
            "http://seed.example/data/f.bin"
        );
    }
}
