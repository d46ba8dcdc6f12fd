//! Synthetic download payloads, generated in parallel and streamed with pacing.
//!
//! With a parallelism of 1 the payload is written as raw fixed-size blocks.
//! Otherwise it is split into contiguous chunks, each filled by its own
//! blocking worker, and delivered in completion order. Every chunk is framed
//! with an 8-byte header (big-endian `u32` index, big-endian `u32` length)
//! so receivers can reassemble or verify out-of-order data.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::StreamError;
use crate::transport::Transport;

const MIB: u64 = 1024 * 1024;

/// Payload size when the request names none.
pub const DEFAULT_TOTAL_SIZE: u64 = 50 * MIB;
/// Upper bound on a single download.
pub const DEFAULT_MAX_TOTAL_SIZE: u64 = 100 * MIB;
/// Hard cap on generation workers per download.
pub const MAX_PARALLELISM: usize = 10;
/// Chunk floor when the request names none.
pub const DEFAULT_MIN_CHUNK_SIZE: u64 = MIB;
/// Block size on the single-stream path.
pub const STREAM_BLOCK_SIZE: usize = 8 * 1024;
/// Length of a chunk frame header.
pub const FRAME_HEADER_LEN: usize = 8;
/// Delay between chunk frames.
pub const PACING_DELAY: Duration = Duration::from_millis(10);

/// Single-stream blocks written between flushes.
const FLUSH_EVERY_BLOCKS: usize = 8;

/// Server-side bounds applied to download requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadLimits {
    pub default_size: u64,
    pub max_size: u64,
}

impl Default for DownloadLimits {
    fn default() -> Self {
        Self {
            default_size: DEFAULT_TOTAL_SIZE,
            max_size: DEFAULT_MAX_TOTAL_SIZE,
        }
    }
}

/// Effective download shape after clamping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamParams {
    pub total_size: u64,
    pub parallelism: usize,
    pub min_chunk_size: u64,
}

/// One contiguous slice of the payload owned by a single worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRange {
    pub index: u32,
    pub offset: u64,
    pub len: u64,
}

/// A generated chunk ready to be framed.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub index: u32,
    pub payload: Bytes,
}

/// What a finished stream delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSummary {
    /// Payload bytes, excluding frame headers.
    pub payload_bytes: u64,
    pub chunks: usize,
}

impl StreamParams {
    /// Clamps each requested value independently. Missing or zero values
    /// fall back to defaults.
    pub fn clamped(
        total_size: Option<u64>,
        parallelism: Option<usize>,
        min_chunk_size: Option<u64>,
        limits: &DownloadLimits,
    ) -> Self {
        // Frame headers carry the length as a u32.
        let max_size = limits.max_size.clamp(1, u64::from(u32::MAX));
        let total_size = total_size
            .filter(|&s| s > 0)
            .unwrap_or(limits.default_size)
            .clamp(1, max_size);
        let parallelism = parallelism.unwrap_or(1).clamp(1, MAX_PARALLELISM);
        let min_chunk_size = min_chunk_size
            .filter(|&s| s > 0)
            .unwrap_or(DEFAULT_MIN_CHUNK_SIZE);

        Self {
            total_size,
            parallelism,
            min_chunk_size,
        }
    }

    pub fn is_single_stream(&self) -> bool {
        self.parallelism == 1
    }

    /// max(minimum, total / parallelism).
    pub fn chunk_size(&self) -> u64 {
        self.min_chunk_size
            .max(self.total_size / self.parallelism as u64)
            .max(1)
    }

    /// Partitions the payload. The last range absorbs the remainder.
    pub fn plan(&self) -> Vec<ChunkRange> {
        let chunk_size = self.chunk_size();
        let count = (self.total_size / chunk_size).clamp(1, self.parallelism as u64);

        (0..count)
            .map(|i| {
                let offset = i * chunk_size;
                let len = if i + 1 == count {
                    self.total_size - offset
                } else {
                    chunk_size
                };
                ChunkRange {
                    index: i as u32,
                    offset,
                    len,
                }
            })
            .collect()
    }

    /// Number of chunks the download will carry (1 for a single stream).
    pub fn chunk_count(&self) -> usize {
        if self.is_single_stream() {
            1
        } else {
            self.plan().len()
        }
    }

    /// Bytes on the wire, including frame headers.
    pub fn encoded_len(&self) -> u64 {
        if self.is_single_stream() {
            self.total_size
        } else {
            self.total_size + (FRAME_HEADER_LEN * self.chunk_count()) as u64
        }
    }
}

impl Chunk {
    pub fn header(&self) -> [u8; FRAME_HEADER_LEN] {
        encode_header(self.index, self.payload.len() as u32)
    }
}

/// Encodes a frame header.
pub fn encode_header(index: u32, len: u32) -> [u8; FRAME_HEADER_LEN] {
    let mut header = [0u8; FRAME_HEADER_LEN];
    header[..4].copy_from_slice(&index.to_be_bytes());
    header[4..].copy_from_slice(&len.to_be_bytes());
    header
}

/// Decodes `(index, len)` from the start of `buf`.
pub fn decode_header(buf: &[u8]) -> Option<(u32, u32)> {
    let header: &[u8; FRAME_HEADER_LEN] = buf.get(..FRAME_HEADER_LEN)?.try_into().ok()?;
    let index = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
    Some((index, len))
}

/// Fills one range from a dedicated generator instance.
///
/// Seeds come from the thread-local OS-seeded generator, so workers started
/// in the same instant never share a sequence. Content only needs to be
/// incompressible, not secret.
pub fn generate_chunk(range: ChunkRange) -> Chunk {
    let mut rng = StdRng::from_rng(&mut rand::rng());
    let mut payload = BytesMut::zeroed(range.len as usize);
    rng.fill_bytes(&mut payload);
    Chunk {
        index: range.index,
        payload: payload.freeze(),
    }
}

/// Streams a synthetic payload of `params.total_size` bytes into `transport`.
///
/// Returns early with [`StreamError::Cancelled`] when `cancel` fires and with
/// [`StreamError::Disconnected`] when the transport closes.
pub async fn generate_stream<T: Transport>(
    params: StreamParams,
    transport: &mut T,
    cancel: &CancellationToken,
) -> Result<StreamSummary, StreamError> {
    if params.is_single_stream() {
        stream_single(params.total_size, transport, cancel).await
    } else {
        stream_chunked(params, transport, cancel).await
    }
}

async fn stream_single<T: Transport>(
    total_size: u64,
    transport: &mut T,
    cancel: &CancellationToken,
) -> Result<StreamSummary, StreamError> {
    let mut rng = StdRng::from_rng(&mut rand::rng());
    // Blocks are split off this buffer; its storage is reclaimed once the
    // transport releases earlier blocks.
    let mut buf = BytesMut::with_capacity(STREAM_BLOCK_SIZE * FLUSH_EVERY_BLOCKS);
    let mut remaining = total_size;
    let mut blocks = 0usize;

    while remaining > 0 {
        if cancel.is_cancelled() {
            return Err(StreamError::Cancelled);
        }
        if transport.is_closed() {
            return Err(StreamError::Disconnected);
        }

        let n = remaining.min(STREAM_BLOCK_SIZE as u64) as usize;
        buf.resize(n, 0);
        rng.fill_bytes(&mut buf);
        let block = buf.split().freeze();

        tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(StreamError::Cancelled),
            res = transport.write(block) => res?,
        }

        remaining -= n as u64;
        blocks += 1;
        if blocks % FLUSH_EVERY_BLOCKS == 0 {
            flush(transport, cancel).await?;
        }
    }

    flush(transport, cancel).await?;
    Ok(StreamSummary {
        payload_bytes: total_size,
        chunks: 1,
    })
}

async fn stream_chunked<T: Transport>(
    params: StreamParams,
    transport: &mut T,
    cancel: &CancellationToken,
) -> Result<StreamSummary, StreamError> {
    let plan = params.plan();
    let expected = plan.len();
    let (tx, mut rx) = mpsc::channel::<Chunk>(expected);

    for range in plan {
        let tx = tx.clone();
        tokio::task::spawn_blocking(move || {
            let chunk = generate_chunk(range);
            // A closed queue means the coordinator already gave up.
            let _ = tx.blocking_send(chunk);
        });
    }
    drop(tx);

    let mut summary = StreamSummary {
        payload_bytes: 0,
        chunks: 0,
    };

    loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(StreamError::Cancelled),
            next = rx.recv() => next,
        };
        let Some(chunk) = next else { break };

        let len = chunk.payload.len() as u64;
        write_frame(transport, cancel, chunk).await?;
        summary.payload_bytes += len;
        summary.chunks += 1;

        if summary.chunks < expected {
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(StreamError::Cancelled),
                () = tokio::time::sleep(PACING_DELAY) => {}
            }
        }
    }

    if summary.chunks < expected {
        return Err(StreamError::Generation(format!(
            "{} of {expected} chunks produced",
            summary.chunks
        )));
    }
    Ok(summary)
}

async fn write_frame<T: Transport>(
    transport: &mut T,
    cancel: &CancellationToken,
    chunk: Chunk,
) -> Result<(), StreamError> {
    let header = Bytes::copy_from_slice(&chunk.header());
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(StreamError::Cancelled),
        res = send_frame(transport, header, chunk.payload) => res,
    }
}

async fn send_frame<T: Transport>(
    transport: &mut T,
    header: Bytes,
    payload: Bytes,
) -> Result<(), StreamError> {
    transport.write(header).await?;
    transport.write(payload).await?;
    transport.flush().await
}

async fn flush<T: Transport>(
    transport: &mut T,
    cancel: &CancellationToken,
) -> Result<(), StreamError> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(StreamError::Cancelled),
        res = transport.flush() => res,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::transport::{ChannelTransport, WriterTransport};

    fn params(total: u64, parallelism: usize, min_chunk: u64) -> StreamParams {
        StreamParams::clamped(
            Some(total),
            Some(parallelism),
            Some(min_chunk),
            &DownloadLimits::default(),
        )
    }

    /// Splits a framed body into `(index, len)` pairs, checking every length.
    fn parse_frames(mut body: &[u8]) -> Vec<(u32, u32)> {
        let mut frames = Vec::new();
        while !body.is_empty() {
            let (index, len) = decode_header(body).expect("truncated header");
            body = &body[FRAME_HEADER_LEN..];
            assert!(body.len() >= len as usize, "truncated payload");
            body = &body[len as usize..];
            frames.push((index, len));
        }
        frames
    }

    #[test]
    fn clamps_each_parameter() {
        let limits = DownloadLimits::default();
        let p = StreamParams::clamped(None, None, None, &limits);
        assert_eq!(p.total_size, DEFAULT_TOTAL_SIZE);
        assert_eq!(p.parallelism, 1);
        assert_eq!(p.min_chunk_size, DEFAULT_MIN_CHUNK_SIZE);

        let p = StreamParams::clamped(Some(u64::MAX), Some(64), Some(0), &limits);
        assert_eq!(p.total_size, DEFAULT_MAX_TOTAL_SIZE);
        assert_eq!(p.parallelism, MAX_PARALLELISM);
        assert_eq!(p.min_chunk_size, DEFAULT_MIN_CHUNK_SIZE);

        let p = StreamParams::clamped(Some(0), Some(0), None, &limits);
        assert_eq!(p.total_size, DEFAULT_TOTAL_SIZE);
        assert_eq!(p.parallelism, 1);
    }

    #[test]
    fn plan_for_ten_million_over_four() {
        let p = params(10_000_000, 4, MIB);
        let plan = p.plan();
        assert_eq!(plan.len(), 4);
        assert_eq!(plan.iter().map(|r| r.len).sum::<u64>(), 10_000_000);
        let indices: Vec<u32> = plan.iter().map(|r| r.index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);
        assert!(plan.iter().all(|r| r.len == 2_500_000));
    }

    #[test]
    fn last_chunk_absorbs_remainder() {
        let p = params(10_000_003, 4, 1);
        let plan = p.plan();
        assert_eq!(plan.len(), 4);
        assert_eq!(plan[3].len, 2_500_003);
        assert_eq!(plan[3].offset, 7_500_000);
        assert_eq!(plan.iter().map(|r| r.len).sum::<u64>(), 10_000_003);
    }

    #[test]
    fn minimum_chunk_size_reduces_chunk_count() {
        // 3 MiB over 8 workers with a 1 MiB floor yields three chunks.
        let p = params(3 * MIB, 8, MIB);
        let plan = p.plan();
        assert_eq!(plan.len(), 3);
        assert_eq!(plan.iter().map(|r| r.len).sum::<u64>(), 3 * MIB);
        assert_eq!(p.encoded_len(), 3 * MIB + 3 * FRAME_HEADER_LEN as u64);
    }

    #[test]
    fn payload_smaller_than_minimum_is_one_short_chunk() {
        let p = params(1000, 4, MIB);
        let plan = p.plan();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].len, 1000);
    }

    #[test]
    fn ranges_are_contiguous() {
        let p = params(7 * MIB + 13, 7, 1);
        let mut expected_offset = 0;
        for range in p.plan() {
            assert_eq!(range.offset, expected_offset);
            expected_offset += range.len;
        }
        assert_eq!(expected_offset, 7 * MIB + 13);
    }

    #[test]
    fn header_roundtrip_is_big_endian() {
        let header = encode_header(3, 0x0102_0304);
        assert_eq!(header, [0, 0, 0, 3, 1, 2, 3, 4]);
        assert_eq!(decode_header(&header), Some((3, 0x0102_0304)));
        assert_eq!(decode_header(&header[..7]), None);
    }

    #[test]
    fn independent_workers_produce_different_content() {
        let range = ChunkRange {
            index: 0,
            offset: 0,
            len: 4096,
        };
        let a = generate_chunk(range);
        let b = generate_chunk(range);
        assert_eq!(a.payload.len(), 4096);
        assert_ne!(a.payload, b.payload);
    }

    #[tokio::test]
    async fn single_stream_writes_exact_size() {
        let mut transport = WriterTransport::new(Vec::new());
        let cancel = CancellationToken::new();
        let summary = generate_stream(params(100_000, 1, MIB), &mut transport, &cancel)
            .await
            .unwrap();

        assert_eq!(summary.payload_bytes, 100_000);
        assert_eq!(summary.chunks, 1);
        assert_eq!(transport.into_inner().len(), 100_000);
    }

    #[tokio::test]
    async fn chunked_stream_covers_every_index_once() {
        let mut transport = WriterTransport::new(Vec::new());
        let cancel = CancellationToken::new();
        let summary = generate_stream(params(10_000_000, 4, MIB), &mut transport, &cancel)
            .await
            .unwrap();
        assert_eq!(summary.payload_bytes, 10_000_000);
        assert_eq!(summary.chunks, 4);

        let body = transport.into_inner();
        assert_eq!(body.len(), 10_000_000 + 4 * FRAME_HEADER_LEN);

        let frames = parse_frames(&body);
        let indices: BTreeSet<u32> = frames.iter().map(|&(i, _)| i).collect();
        assert_eq!(frames.len(), 4);
        assert_eq!(indices, BTreeSet::from([0, 1, 2, 3]));
        assert_eq!(
            frames.iter().map(|&(_, len)| u64::from(len)).sum::<u64>(),
            10_000_000
        );
    }

    #[tokio::test]
    async fn chunked_stream_at_max_parallelism() {
        let mut transport = WriterTransport::new(Vec::new());
        let cancel = CancellationToken::new();
        let p = params(10 * MIB + 7, MAX_PARALLELISM, MIB);
        generate_stream(p, &mut transport, &cancel).await.unwrap();

        let frames = parse_frames(&transport.into_inner());
        let indices: BTreeSet<u32> = frames.iter().map(|&(i, _)| i).collect();
        assert_eq!(indices, (0..10).collect::<BTreeSet<u32>>());
        assert_eq!(
            frames.iter().map(|&(_, len)| u64::from(len)).sum::<u64>(),
            10 * MIB + 7
        );
    }

    #[tokio::test]
    async fn cancelled_before_start() {
        let mut transport = WriterTransport::new(Vec::new());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let single = generate_stream(params(MIB, 1, MIB), &mut transport, &cancel).await;
        assert!(matches!(single, Err(StreamError::Cancelled)));

        let chunked = generate_stream(params(4 * MIB, 4, MIB), &mut transport, &cancel).await;
        assert!(matches!(chunked, Err(StreamError::Cancelled)));
    }

    #[tokio::test]
    async fn disconnect_stops_single_stream() {
        let (mut transport, mut rx) = ChannelTransport::channel(1);
        let cancel = CancellationToken::new();

        let reader = tokio::spawn(async move {
            // Take a couple of blocks, then hang up.
            rx.recv().await.unwrap();
            rx.recv().await.unwrap();
        });

        let result = generate_stream(params(10 * MIB, 1, MIB), &mut transport, &cancel).await;
        reader.await.unwrap();
        assert!(matches!(result, Err(StreamError::Disconnected)));
    }

    #[tokio::test]
    async fn disconnect_stops_chunked_stream() {
        let (mut transport, rx) = ChannelTransport::channel(1);
        drop(rx);
        let cancel = CancellationToken::new();

        let result = generate_stream(params(4 * MIB, 4, MIB), &mut transport, &cancel).await;
        assert!(matches!(result, Err(StreamError::Disconnected)));
    }

    #[tokio::test]
    async fn cancel_during_chunked_stream() {
        let (mut transport, mut rx) = ChannelTransport::channel(1);
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        let reader = tokio::spawn(async move {
            // Header of the first frame, then cancel while the rest waits.
            rx.recv().await.unwrap();
            canceller.cancel();
            rx
        });

        let result = generate_stream(params(8 * MIB, 8, MIB), &mut transport, &cancel).await;
        let _rx = reader.await.unwrap();
        assert!(matches!(result, Err(StreamError::Cancelled)));
    }

    /// Accepts every write but never completes a flush.
    struct StuckFlush;

    impl Transport for StuckFlush {
        async fn write(&mut self, _data: Bytes) -> Result<(), StreamError> {
            Ok(())
        }

        async fn flush(&mut self) -> Result<(), StreamError> {
            std::future::pending().await
        }

        fn is_closed(&self) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn cancel_interrupts_stalled_flush() {
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            generate_stream(params(MIB, 1, MIB), &mut StuckFlush, &cancel),
        )
        .await
        .expect("flush ignored cancellation");
        assert!(matches!(result, Err(StreamError::Cancelled)));
    }
}
