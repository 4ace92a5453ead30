//! Two-phase throughput test over the throughput channel.
//!
//! One side uploads while the other downloads, then they swap. The side
//! that started the round announces the size and uploads first.
//!
//! ```text
//! starter                         peer
//!   "1000000" ─────────────────────▶ accept
//!   ◀──────────────────────── "TEST-ACK"
//!   chunk × ceil(size / chunk) ─────▶ count bytes
//!   "END" ─────────────────────────▶
//!   ◀───────────────────────── "END-ACK"
//!   count bytes ◀──────────── chunk × n
//!   ◀────────────────────────────── "END"
//!   "END-ACK" ─────────────────────▶
//! ```

use std::fmt;
use std::time::Duration;

use async_stream::try_stream;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use tokio::time::Instant;
use tracing::{debug, info};

use pairspeed_types::ControlToken;

use crate::error::{Error, Result};
use crate::event::{Event, EventKind, Payload};
use crate::transport::TransportChannel;

pub const CHUNK_SIZE: usize = 16_000;
pub const REPORT_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Upload,
    Download,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Upload => f.write_str("upload"),
            Self::Download => f.write_str("download"),
        }
    }
}

/// One reporting window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub bytes_per_sec: f64,
    /// Bytes moved since the phase began.
    pub transferred: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhaseSummary {
    pub direction: Direction,
    pub bytes: u64,
    pub elapsed: Duration,
    /// Whole-phase bytes per second.
    pub average: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Report {
    Started { direction: Direction },
    Rate { direction: Direction, sample: Sample },
    Finished(PhaseSummary),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TestSummary {
    pub upload: PhaseSummary,
    pub download: PhaseSummary,
}

/// Send the chosen size and wait for the peer to be ready.
pub async fn announce(channel: &mut TransportChannel, size: u64) -> Result<()> {
    channel.send_text(ControlToken::Size(size).to_string())?;
    match next_control(channel).await? {
        ControlToken::TestAck => {
            debug!(size, "peer accepted test size");
            Ok(())
        }
        other => Err(Error::protocol(format!("expected TEST-ACK, got {}", other))),
    }
}

/// Take the size the peer announced in `text` and confirm it.
pub fn accept(channel: &TransportChannel, text: &str) -> Result<u64> {
    match ControlToken::parse(text) {
        Some(ControlToken::Size(size)) => {
            channel.send_text(ControlToken::TestAck.to_string())?;
            debug!(size, "accepted test size");
            Ok(size)
        }
        _ => Err(Error::protocol(format!("expected a test size, got {:?}", text))),
    }
}

/// Next text token on the channel. Binary data here is out of turn.
async fn next_control(channel: &mut TransportChannel) -> Result<ControlToken> {
    let kinds = [EventKind::Message, EventKind::Error, EventKind::Close];
    match channel.events.next_of(&kinds).await {
        Some(Event::Message(Payload::Text(text))) => ControlToken::parse(&text)
            .ok_or_else(|| Error::protocol(format!("unrecognized control token {:?}", text))),
        Some(Event::Message(Payload::Binary(b))) => Err(Error::protocol(format!(
            "unexpected {}-byte chunk while waiting for a control token",
            b.len()
        ))),
        Some(Event::Error(e)) => Err(Error::transport(e)),
        _ => Err(Error::transport("throughput channel closed")),
    }
}

pub struct ThroughputTest<'a> {
    channel: &'a mut TransportChannel,
    size: u64,
    chunk_size: usize,
    report_interval: Duration,
    transferred: u64,
}

impl<'a> ThroughputTest<'a> {
    pub fn new(channel: &'a mut TransportChannel, size: u64) -> Self {
        Self {
            channel,
            size,
            chunk_size: CHUNK_SIZE,
            report_interval: REPORT_INTERVAL,
            transferred: 0,
        }
    }

    /// # Panics
    /// Panics if `chunk_size` is zero.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        assert!(chunk_size > 0, "chunk size must be positive");
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_report_interval(mut self, interval: Duration) -> Self {
        self.report_interval = interval;
        self
    }

    /// Run both phases, uploading first if `send_first`.
    pub async fn run<F: FnMut(Report)>(&mut self, send_first: bool, mut report: F) -> Result<TestSummary> {
        let (upload, download) = if send_first {
            let upload = self.upload_phase(&mut report).await?;
            (upload, self.download_phase(&mut report).await?)
        } else {
            let download = self.download_phase(&mut report).await?;
            (self.upload_phase(&mut report).await?, download)
        };
        Ok(TestSummary { upload, download })
    }

    pub async fn upload_phase<F: FnMut(Report)>(&mut self, report: &mut F) -> Result<PhaseSummary> {
        let direction = Direction::Upload;
        report(Report::Started { direction });
        let started = Instant::now();
        {
            let samples = self.upload();
            futures_util::pin_mut!(samples);
            while let Some(sample) = samples.next().await {
                report(Report::Rate { direction, sample: sample? });
            }
        }
        Ok(self.finish(direction, started, report))
    }

    pub async fn download_phase<F: FnMut(Report)>(&mut self, report: &mut F) -> Result<PhaseSummary> {
        let direction = Direction::Download;
        report(Report::Started { direction });
        let started = Instant::now();
        {
            let samples = self.download();
            futures_util::pin_mut!(samples);
            while let Some(sample) = samples.next().await {
                report(Report::Rate { direction, sample: sample? });
            }
        }
        Ok(self.finish(direction, started, report))
    }

    fn finish<F: FnMut(Report)>(&self, direction: Direction, started: Instant, report: &mut F) -> PhaseSummary {
        let elapsed = started.elapsed();
        // Millisecond floor keeps an instant local transfer finite.
        let secs = elapsed.as_secs_f64().max(1e-3);
        let summary = PhaseSummary {
            direction,
            bytes: self.transferred,
            elapsed,
            average: self.transferred as f64 / secs,
        };
        info!(%direction, bytes = summary.bytes, elapsed_ms = elapsed.as_millis() as u64, "throughput phase done");
        report(Report::Finished(summary));
        summary
    }

    /// Send the agreed size in chunks, waiting for the transport buffer to
    /// drain after each one, then END and wait for END-ACK.
    fn upload(&mut self) -> impl Stream<Item = Result<Sample>> + Send + '_ {
        try_stream! {
            let buffer = Bytes::from(vec![0u8; self.chunk_size]);
            let chunks = self.size.div_ceil(self.chunk_size as u64);
            self.transferred = 0;
            let mut window = Window::new();

            for _ in 0..chunks {
                if let Some(bytes_per_sec) = window.roll(self.report_interval) {
                    yield Sample { bytes_per_sec, transferred: self.transferred };
                }
                let len = (self.size - self.transferred).min(self.chunk_size as u64);
                self.channel.send_binary(buffer.slice(..len as usize))?;
                self.channel.flush().await;
                self.transferred += len;
                window.add(len);
            }

            self.channel.send_text(ControlToken::End.to_string())?;
            self.channel.flush().await;
            let ack = match next_control(&mut *self.channel).await? {
                ControlToken::EndAck => Ok(()),
                other => Err(Error::protocol(format!("expected END-ACK, got {}", other))),
            };
            ack?;
        }
    }

    /// Count incoming chunk bytes until END, then send END-ACK.
    fn download(&mut self) -> impl Stream<Item = Result<Sample>> + Send + '_ {
        try_stream! {
            let kinds = [EventKind::Message, EventKind::Error, EventKind::Close];
            self.transferred = 0;
            let mut window = Window::new();

            loop {
                if let Some(bytes_per_sec) = window.roll(self.report_interval) {
                    yield Sample { bytes_per_sec, transferred: self.transferred };
                }
                let step = match self.channel.events.next_of(&kinds).await {
                    Some(Event::Message(Payload::Binary(chunk))) => Ok(Some(chunk.len() as u64)),
                    Some(Event::Message(Payload::Text(text))) => match ControlToken::parse(&text) {
                        Some(ControlToken::End) => Ok(None),
                        _ => Err(Error::protocol(format!("unexpected {:?} during download", text))),
                    },
                    Some(Event::Error(e)) => Err(Error::transport(e)),
                    _ => Err(Error::transport("throughput channel closed")),
                };
                match step? {
                    Some(len) => {
                        self.transferred += len;
                        window.add(len);
                    }
                    None => break,
                }
            }

            self.channel.send_text(ControlToken::EndAck.to_string())?;
        }
    }
}

/// Bytes counted since the current reporting window opened.
struct Window {
    opened: Instant,
    bytes: u64,
}

impl Window {
    fn new() -> Self {
        Self { opened: Instant::now(), bytes: 0 }
    }

    fn add(&mut self, bytes: u64) {
        self.bytes += bytes;
    }

    /// Close the window once it spans `interval`, returning its rate.
    fn roll(&mut self, interval: Duration) -> Option<f64> {
        let now = Instant::now();
        let span = now - self.opened;
        if span < interval || span.is_zero() {
            return None;
        }
        let rate = self.bytes as f64 / span.as_secs_f64();
        self.opened = now;
        self.bytes = 0;
        Some(rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::loopback;

    #[tokio::test]
    async fn megabyte_upload_is_63_chunks_then_end() {
        let (mut sender, mut receiver) = loopback::pair("speed");
        let upload = tokio::spawn(async move {
            let mut test = ThroughputTest::new(&mut sender, 1_000_000);
            test.upload_phase(&mut |_: Report| {}).await
        });

        let mut chunks = 0;
        let mut bytes = 0;
        loop {
            match receiver.events.next_of(&[EventKind::Message]).await.unwrap() {
                Event::Message(Payload::Binary(b)) => {
                    chunks += 1;
                    bytes += b.len();
                }
                Event::Message(Payload::Text(t)) => {
                    assert_eq!(t, "END");
                    break;
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(chunks, 63);
        assert_eq!(bytes, 1_000_000);

        // Not done until END-ACK arrives.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(!upload.is_finished());

        receiver.send_text("END-ACK").unwrap();
        let summary = upload.await.unwrap().unwrap();
        assert_eq!(summary.bytes, 1_000_000);
    }

    #[tokio::test(start_paused = true)]
    async fn both_phases_count_exact_bytes() {
        let (mut a, mut b) = loopback::pair_with_delay("speed", Duration::from_millis(2));
        let size = 1_000_000;
        // 63 chunks at 2ms each span several 50ms windows.
        let window = Duration::from_millis(50);

        let starter = tokio::spawn(async move {
            let mut reports = Vec::new();
            let summary = ThroughputTest::new(&mut a, size)
                .with_report_interval(window)
                .run(true, |r| reports.push(r))
                .await;
            (summary, reports)
        });
        let mut reports = Vec::new();
        let peer = ThroughputTest::new(&mut b, size)
            .with_report_interval(window)
            .run(false, |r| reports.push(r))
            .await
            .unwrap();
        let (starter, starter_reports) = starter.await.unwrap();
        let starter = starter.unwrap();

        assert_eq!(starter.upload.bytes, size);
        assert_eq!(starter.download.bytes, size);
        assert_eq!(peer.upload.bytes, size);
        assert_eq!(peer.download.bytes, size);

        // Phase order shows in the reports.
        assert_eq!(starter_reports.first(), Some(&Report::Started { direction: Direction::Upload }));
        assert_eq!(reports.first(), Some(&Report::Started { direction: Direction::Download }));
        assert!(matches!(
            starter_reports.last(),
            Some(Report::Finished(PhaseSummary { direction: Direction::Download, .. }))
        ));
        assert!(starter_reports.iter().any(|r| matches!(r, Report::Rate { direction: Direction::Upload, .. })));
        assert!(reports.iter().any(|r| matches!(r, Report::Rate { direction: Direction::Download, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn windowed_rate_tracks_link_speed() {
        let (mut a, mut b) = loopback::pair_with_delay("speed", Duration::from_millis(10));
        let size = CHUNK_SIZE as u64 * 60;

        let receiver = tokio::spawn(async move {
            let mut test = ThroughputTest::new(&mut b, size);
            test.download_phase(&mut |_: Report| {}).await
        });
        let mut rates = Vec::new();
        let mut test = ThroughputTest::new(&mut a, size);
        test.upload_phase(&mut |r: Report| {
            if let Report::Rate { sample, .. } = r {
                rates.push(sample.bytes_per_sec);
            }
        })
        .await
        .unwrap();
        assert_eq!(receiver.await.unwrap().unwrap().bytes, size);

        // About one chunk per 10ms.
        assert!(rates.len() >= 2);
        for rate in rates {
            assert!(rate > 1.0e6 && rate < 1.7e6, "{}", rate);
        }
    }

    #[tokio::test]
    async fn size_announcement_round_trip() {
        let (mut a, mut b) = loopback::pair("speed");
        let announcer = tokio::spawn(async move { announce(&mut a, 250_000).await });
        let text = match b.events.next_of(&[EventKind::Message]).await {
            Some(Event::Message(Payload::Text(t))) => t,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(accept(&b, &text).unwrap(), 250_000);
        announcer.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn accept_rejects_non_size() {
        let (_a, b) = loopback::pair("speed");
        assert!(matches!(accept(&b, "END"), Err(Error::ProtocolViolation(_))));
        assert!(matches!(accept(&b, "12kb"), Err(Error::ProtocolViolation(_))));
    }

    #[tokio::test]
    async fn stray_text_during_download_is_a_violation() {
        let (a, mut b) = loopback::pair("speed");
        a.send_binary(Bytes::from_static(&[0; 10])).unwrap();
        a.send_text("TEST-ACK").unwrap();
        let err = ThroughputTest::new(&mut b, 10)
            .download_phase(&mut |_: Report| {})
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ProtocolViolation(_)));
    }

    #[tokio::test]
    async fn zero_size_sends_only_end() {
        let (mut a, mut b) = loopback::pair("speed");
        let receiver = tokio::spawn(async move {
            ThroughputTest::new(&mut b, 0).download_phase(&mut |_: Report| {}).await
        });
        let up = ThroughputTest::new(&mut a, 0).upload_phase(&mut |_: Report| {}).await.unwrap();
        assert_eq!(up.bytes, 0);
        assert_eq!(receiver.await.unwrap().unwrap().bytes, 0);
    }
}
