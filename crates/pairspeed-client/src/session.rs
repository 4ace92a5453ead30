//! One measurement session from relay connect to repeated test rounds.
//!
//! ```text
//! open relay ─▶ register + pair ─▶ negotiate ─▶ channels open
//!   ┌───────────────────────────────────────────────────────┐
//!   │ controls on, latency probing                          │
//!   │ race: local trigger  vs  peer's size announcement     │
//!   │ controls off, probing stopped                         │
//!   │ agree on size, run both throughput phases             │
//!   └───────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use futures_util::Stream;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::SessionConfig;
use crate::driver::CancellableDriver;
use crate::error::{Error, Result};
use crate::event::{Event, EventKind, EventSource, Fired, Payload, on, select};
use crate::format::{format_latency, format_progress, format_rate};
use crate::latency::LatencyProbe;
use crate::negotiation::{EngineSignal, NegotiationDriver, NegotiationEngine, establish_channels};
use crate::pairing::Pairing;
use crate::relay_link::RelayLink;
use crate::signal::SignalChannel;
use crate::sink::{StatusSink, StatusUpdate};
use crate::throughput::{Report, ThroughputTest, accept, announce};
use crate::transport::TransportChannel;

/// Everything a session consumes from its surroundings.
pub struct SessionIo<S> {
    pub link: RelayLink,
    pub engine: Arc<dyn NegotiationEngine>,
    pub engine_signals: mpsc::UnboundedReceiver<EngineSignal>,
    /// Peer identifiers typed by the user.
    pub submissions: S,
    /// `Trigger(size)` whenever the user asks for a test.
    pub controls: EventSource,
    pub sink: Arc<dyn StatusSink>,
}

/// Run until the relay, the transport or the peer fails. The failure is
/// also reported to the sink.
pub async fn run_session<S>(config: &SessionConfig, io: SessionIo<S>) -> Result<()>
where
    S: Stream<Item = String> + Unpin,
{
    let sink = io.sink.clone();
    let result = session(config, io).await;
    if let Err(e) = &result {
        warn!("session ended: {}", e);
        sink.update(StatusUpdate::Error { message: e.to_string() });
    }
    result
}

async fn session<S>(config: &SessionConfig, io: SessionIo<S>) -> Result<()>
where
    S: Stream<Item = String> + Unpin,
{
    let SessionIo { link, engine, engine_signals, submissions, mut controls, sink } = io;
    sink.update(StatusUpdate::Controls { enabled: false });

    let channel = SignalChannel::open(link).await?;
    let pairing = Pairing::register(channel.clone(), config.relay_timeout).await?;
    let peer = pairing.pair(submissions, sink.as_ref()).await?;

    let mut negotiation =
        NegotiationDriver::spawn(engine.clone(), engine_signals, channel, peer, config.relay_timeout);
    let channels = tokio::select! {
        channels = establish_channels(engine.as_ref()) => channels?,
        failure = negotiation.failure() => return Err(failure),
    };
    info!(peer = peer.peer, role = %peer.role, "measurement channels ready");

    let probe = LatencyProbe::spawn(channels.latency, peer.role.side(), config.probe_period);
    let mut throughput = channels.throughput;

    loop {
        sink.update(StatusUpdate::Controls { enabled: true });
        let mut latency = latency_display(&probe, sink.clone());
        latency.start();

        let fired = select(vec![
            on(&mut controls, &[EventKind::Trigger]),
            on(&mut throughput.events, &[EventKind::Message, EventKind::Error, EventKind::Close]),
        ])
        .await;

        sink.update(StatusUpdate::Controls { enabled: false });
        latency.stop().await;
        sink.update(StatusUpdate::Latency { text: None });

        let (size, send_first) = agree_on_size(&mut throughput, fired).await?;
        info!(size, send_first, "throughput test starting");

        let render_sink = sink.clone();
        ThroughputTest::new(&mut throughput, size)
            .with_chunk_size(config.chunk_size)
            .with_report_interval(config.report_interval)
            .run(send_first, |report| render(render_sink.as_ref(), size, report))
            .await?;
    }
}

fn latency_display(probe: &LatencyProbe, sink: Arc<dyn StatusSink>) -> CancellableDriver<Result<Duration>> {
    CancellableDriver::new(probe.run(), move |rtt: Result<Duration>| match rtt {
        Ok(rtt) => sink.update(StatusUpdate::Latency { text: Some(format_latency(rtt)) }),
        Err(e) => sink.update(StatusUpdate::Error { message: e.to_string() }),
    })
}

/// The local trigger announces its size and sends first; a size from the
/// peer is accepted and we receive first.
async fn agree_on_size(throughput: &mut TransportChannel, fired: Option<Fired>) -> Result<(u64, bool)> {
    match fired {
        Some(Fired { event: Event::Trigger(size), .. }) => {
            announce(throughput, size).await?;
            Ok((size, true))
        }
        Some(Fired { event: Event::Message(Payload::Text(text)), .. }) => {
            Ok((accept(throughput, &text)?, false))
        }
        Some(Fired { event: Event::Message(Payload::Binary(b)), .. }) => Err(Error::protocol(format!(
            "unexpected {}-byte chunk before a test was agreed",
            b.len()
        ))),
        Some(Fired { event: Event::Error(e), .. }) => Err(Error::transport(e)),
        _ => Err(Error::transport("throughput channel closed")),
    }
}

fn render(sink: &dyn StatusSink, size: u64, report: Report) {
    match report {
        Report::Started { direction } => {
            sink.update(StatusUpdate::Progress { direction, text: format_progress(0, size) });
        }
        Report::Rate { direction, sample } => {
            sink.update(StatusUpdate::Rate { direction, text: format_rate(sample.bytes_per_sec) });
            sink.update(StatusUpdate::Progress {
                direction,
                text: format_progress(sample.transferred, size),
            });
        }
        Report::Finished(summary) => {
            let direction = summary.direction;
            sink.update(StatusUpdate::Progress { direction, text: format_progress(summary.bytes, size) });
            sink.update(StatusUpdate::Average { direction, text: format_rate(summary.average) });
        }
    }
}
