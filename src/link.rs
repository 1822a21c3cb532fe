//! Serial link session to the VMC.
//!
//! The VMC is the bus master: it POLLs continuously and we answer every POLL
//! with exactly one frame. Commands from the rest of the program are queued
//! on the [`LinkHandle`] and go out one per POLL, oldest first, except that a
//! DIRECT_DRIVE jumps the queue because a customer is standing at the machine
//! waiting for it.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::Result;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    select,
    time::{interval, sleep, Instant, MissedTickBehavior},
};
use tokio_serial::{DataBits, Parity, SerialStream, StopBits};
use vmcproto::{
    command::{self, Command, DispenseReport, SelectionInfo},
    frame::{self, Decoder},
    Packet, SequenceCounter,
};

use crate::{backoff::Backoff, shutdown::ShutdownHandle};

pub const BAUD_RATE: u32 = 57600;

/// A quiet VMC is worth a log line after this long without a POLL...
const SILENCE_WARN: Duration = Duration::from_millis(500);
/// ...and the link is declared dead and reopened after this long.
const SILENCE_FATAL: Duration = Duration::from_secs(5);

/// Decoded VMC traffic, as seen by the transaction coordinator.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    Up,
    Down,
    /// keypad selection (`SELECT_CANCEL` with a non-zero selection)
    Select { selection: u16, seq: u8 },
    /// keypad cancel (`SELECT_CANCEL` with selection 0)
    Cancel { seq: u8 },
    Dispense { report: DispenseReport, seq: u8 },
    SelectionInfo(SelectionInfo),
    SelectionStatus { data: Vec<u8>, seq: u8 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedCommand {
    pub cmd: Command,
    pub payload: Vec<u8>,
}

#[derive(Debug, Default)]
struct Shared {
    queue: Mutex<VecDeque<QueuedCommand>>,
    up: AtomicBool,
}

/// Cheap cloneable handle for enqueueing commands toward the VMC.
#[derive(Debug, Clone)]
pub struct LinkHandle {
    shared: Arc<Shared>,
}

impl LinkHandle {
    fn new() -> Self {
        Self {
            shared: Arc::new(Shared::default()),
        }
    }

    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        Self::new()
    }

    pub fn enqueue(&self, cmd: Command, payload: Vec<u8>) {
        self.shared
            .queue
            .lock()
            .expect("link queue poisoned")
            .push_back(QueuedCommand { cmd, payload });
    }

    /// Throw away everything still waiting for a POLL.
    pub fn drain(&self) {
        let dropped = {
            let mut queue = self.shared.queue.lock().expect("link queue poisoned");
            std::mem::take(&mut *queue).len()
        };
        if dropped > 0 {
            debug!(dropped, "drained pending VMC commands");
        }
    }

    pub fn is_up(&self) -> bool {
        self.shared.up.load(Ordering::Relaxed)
    }

    pub(crate) fn set_up(&self, up: bool) {
        self.shared.up.store(up, Ordering::Relaxed);
    }

    /// Next command for the wire; a pending DIRECT_DRIVE wins over anything
    /// queued before it.
    pub(crate) fn pop(&self) -> Option<QueuedCommand> {
        let mut queue = self.shared.queue.lock().expect("link queue poisoned");
        if let Some(at) = queue.iter().position(|c| c.cmd == Command::DirectDrive) {
            return queue.remove(at);
        }
        queue.pop_front()
    }

}

enum Exit {
    Shutdown,
    Unhealthy,
}

pub struct LinkSession {
    port: String,
    handle: LinkHandle,
    events: flume::Sender<LinkEvent>,
    seq: SequenceCounter,
}

impl LinkSession {
    pub fn new(port: &str) -> (Self, LinkHandle, flume::Receiver<LinkEvent>) {
        let handle = LinkHandle::new();
        let (events, events_rx) = flume::unbounded();
        (
            Self {
                port: port.to_owned(),
                handle: handle.clone(),
                events,
                seq: SequenceCounter::new(),
            },
            handle,
            events_rx,
        )
    }

    /// Connect-and-reconnect loop; runs until shutdown.
    pub async fn run(mut self, mut shutdown: ShutdownHandle) {
        let mut backoff = Backoff::reconnect();
        loop {
            let builder = tokio_serial::new(self.port.clone(), BAUD_RATE)
                .data_bits(DataBits::Eight)
                .parity(Parity::None)
                .stop_bits(StopBits::One);
            match SerialStream::open(&builder) {
                Ok(stream) => {
                    info!(port = %self.port, "serial link to VMC up");
                    backoff.reset();
                    self.handle.set_up(true);
                    // ask the VMC for a full catalogue dump on every connect
                    self.handle.enqueue(Command::SyncInfo, Vec::new());
                    let _ = self.events.send(LinkEvent::Up);
                    let outcome = self.drive(stream, &mut shutdown).await;
                    self.handle.set_up(false);
                    let _ = self.events.send(LinkEvent::Down);
                    match outcome {
                        Ok(Exit::Shutdown) => break,
                        Ok(Exit::Unhealthy) => {
                            warn!("VMC went quiet, reopening the serial link")
                        }
                        Err(e) => warn!("serial link failed: {e:#}"),
                    }
                }
                Err(e) => warn!(port = %self.port, "could not open serial port: {e}"),
            }
            let delay = backoff.next_delay();
            debug!("retrying serial link in {delay:?}");
            select! {
                _ = shutdown.wait_for_shutdown() => break,
                _ = sleep(delay) => {}
            }
        }
        trace!("serial link session stopped");
    }

    /// Pump one open connection until shutdown, silence, or an I/O error.
    async fn drive<S: AsyncRead + AsyncWrite + Unpin>(
        &mut self,
        mut io: S,
        shutdown: &mut ShutdownHandle,
    ) -> Result<Exit> {
        let mut decoder = Decoder::new();
        let mut raw = [0u8; 256];
        let mut watchdog = interval(Duration::from_millis(100));
        watchdog.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_poll = Instant::now();
        let mut silence_logged = false;

        loop {
            select! {
                _ = shutdown.wait_for_shutdown() => return Ok(Exit::Shutdown),
                read = io.read(&mut raw) => {
                    let n = read?;
                    if n == 0 {
                        bail!("serial stream closed");
                    }
                    decoder.extend_from_slice(&raw[..n]);
                    while let Some(packet) = decoder.next_packet() {
                        self.dispatch(&mut io, packet, &mut last_poll, &mut silence_logged).await?;
                    }
                }
                _ = watchdog.tick() => {
                    let quiet = last_poll.elapsed();
                    if quiet > SILENCE_FATAL {
                        return Ok(Exit::Unhealthy);
                    }
                    if quiet > SILENCE_WARN && !silence_logged {
                        warn!("no POLL from VMC for {quiet:?}");
                        silence_logged = true;
                    }
                }
            }
        }
    }

    async fn dispatch<S: AsyncWrite + Unpin>(
        &mut self,
        io: &mut S,
        packet: Packet,
        last_poll: &mut Instant,
        silence_logged: &mut bool,
    ) -> Result<()> {
        let Ok(cmd) = Command::try_from(packet.cmd) else {
            warn!(cmd = packet.cmd, "unrecognized command from VMC");
            return self.write_ack(io, packet.seq).await;
        };
        match cmd {
            Command::Poll => {
                *last_poll = Instant::now();
                *silence_logged = false;
                match self.handle.pop() {
                    Some(queued) => {
                        let seq = self.seq.next();
                        trace!(cmd = ?queued.cmd, seq, "transmitting queued command");
                        let wire = frame::encode(queued.cmd.into(), seq, &queued.payload)?;
                        io.write_all(&wire).await?;
                        io.flush().await?;
                    }
                    None => self.write_ack(io, packet.seq).await?,
                }
            }
            Command::Ack => {
                trace!(seq = packet.seq, "VMC acknowledged");
            }
            Command::SelectCancel => {
                match command::parse_selection(&packet.data) {
                    Ok(0) => self.emit(LinkEvent::Cancel { seq: packet.seq }),
                    Ok(selection) => self.emit(LinkEvent::Select {
                        selection,
                        seq: packet.seq,
                    }),
                    Err(e) => warn!("malformed SELECT_CANCEL: {e}"),
                }
                self.write_ack(io, packet.seq).await?;
            }
            Command::DispensingStatus => {
                match DispenseReport::parse(&packet.data) {
                    Ok(report) => self.emit(LinkEvent::Dispense {
                        report,
                        seq: packet.seq,
                    }),
                    Err(e) => warn!("malformed DISPENSING_STATUS: {e}"),
                }
                self.write_ack(io, packet.seq).await?;
            }
            Command::SelectionInfo => {
                match SelectionInfo::parse(&packet.data) {
                    Ok(info) => self.emit(LinkEvent::SelectionInfo(info)),
                    Err(e) => warn!("malformed SELECTION_INFO: {e}"),
                }
                self.write_ack(io, packet.seq).await?;
            }
            Command::SelectionStatus => {
                self.emit(LinkEvent::SelectionStatus {
                    data: packet.data.clone(),
                    seq: packet.seq,
                });
                self.write_ack(io, packet.seq).await?;
            }
            other => {
                // upper-computer-only codes echoed back at us
                warn!(cmd = ?other, "unexpected command direction from VMC");
                self.write_ack(io, packet.seq).await?;
            }
        }
        Ok(())
    }

    fn emit(&self, event: LinkEvent) {
        if self.events.send(event).is_err() {
            warn!("link event receiver gone");
        }
    }

    /// Bare ACK echoing the peer's sequence number.
    async fn write_ack<S: AsyncWrite + Unpin>(&self, io: &mut S, echo_seq: u8) -> Result<()> {
        let wire = frame::encode(Command::Ack.into(), echo_seq, &[])?;
        io.write_all(&wire).await?;
        io.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use tracing_test::traced_test;

    use super::*;
    use crate::shutdown::Shutdown;

    struct Harness {
        vmc: tokio::io::DuplexStream,
        decoder: Decoder,
        handle: LinkHandle,
        events: flume::Receiver<LinkEvent>,
        shutdown: Shutdown,
        task: tokio::task::JoinHandle<()>,
    }

    impl Harness {
        fn start() -> Self {
            let (mut session, handle, events) = LinkSession::new("unused");
            let (uc, vmc) = tokio::io::duplex(4096);
            let shutdown = Shutdown::new();
            let mut sh = shutdown.handle();
            let task = tokio::spawn(async move {
                let _ = session.drive(uc, &mut sh).await;
            });
            Self {
                vmc,
                decoder: Decoder::new(),
                handle,
                events,
                shutdown,
                task,
            }
        }

        async fn send(&mut self, cmd: Command, seq: u8, data: &[u8]) {
            let wire = frame::encode(cmd.into(), seq, data).unwrap();
            self.vmc.write_all(&wire).await.unwrap();
        }

        async fn recv(&mut self) -> Packet {
            let mut buf = [0u8; 512];
            loop {
                if let Some(packet) = self.decoder.next_packet() {
                    return packet;
                }
                let n = self.vmc.read(&mut buf).await.unwrap();
                assert_ne!(n, 0, "link closed unexpectedly");
                self.decoder.extend_from_slice(&buf[..n]);
            }
        }

        async fn stop(self) {
            self.shutdown.trigger_shutdown();
            self.task.await.unwrap();
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn poll_answered_with_echoed_ack() {
        let mut h = Harness::start();
        h.send(Command::Poll, 0x2A, &[]).await;
        let reply = h.recv().await;
        assert_eq!(Command::try_from(reply.cmd), Ok(Command::Ack));
        assert_eq!(reply.seq, 0x2A);
        assert!(reply.data.is_empty());
        h.stop().await;
    }

    #[tokio::test]
    #[traced_test]
    async fn one_transmission_per_poll() {
        let mut h = Harness::start();
        for seq in 1..=10u8 {
            h.send(Command::Poll, seq, &[]).await;
        }
        for seq in 1..=10u8 {
            let reply = h.recv().await;
            assert_eq!(Command::try_from(reply.cmd), Ok(Command::Ack));
            assert_eq!(reply.seq, seq);
        }
        h.stop().await;
    }

    #[tokio::test]
    #[traced_test]
    async fn queued_commands_go_out_fifo_on_polls() {
        let mut h = Harness::start();
        h.handle.enqueue(
            Command::SetPrice,
            command::set_price(command::Target::Selection(1), 100),
        );
        h.handle.enqueue(
            Command::SetCapacity,
            command::set_capacity(command::Target::Selection(1), 5),
        );

        h.send(Command::Poll, 1, &[]).await;
        let first = h.recv().await;
        assert_eq!(Command::try_from(first.cmd), Ok(Command::SetPrice));
        assert_eq!(first.seq, 1); // our counter, not the POLL's

        h.send(Command::Poll, 2, &[]).await;
        let second = h.recv().await;
        assert_eq!(Command::try_from(second.cmd), Ok(Command::SetCapacity));
        assert_eq!(second.seq, 2);

        // queue empty again: back to bare ACKs
        h.send(Command::Poll, 3, &[]).await;
        let third = h.recv().await;
        assert_eq!(Command::try_from(third.cmd), Ok(Command::Ack));
        assert_eq!(third.seq, 3);
        h.stop().await;
    }

    #[tokio::test]
    #[traced_test]
    async fn direct_drive_jumps_the_queue() {
        let mut h = Harness::start();
        h.handle.enqueue(
            Command::SetPrice,
            command::set_price(command::Target::Selection(1), 100),
        );
        h.handle.enqueue(
            Command::DirectDrive,
            command::DirectDrive {
                drop_sensor: true,
                elevator: true,
                selection: 7,
            }
            .encode()
            .to_vec(),
        );

        h.send(Command::Poll, 1, &[]).await;
        let first = h.recv().await;
        assert_eq!(Command::try_from(first.cmd), Ok(Command::DirectDrive));
        assert_eq!(first.data, vec![0x01, 0x01, 0x00, 0x07]);

        h.send(Command::Poll, 2, &[]).await;
        let second = h.recv().await;
        assert_eq!(Command::try_from(second.cmd), Ok(Command::SetPrice));
        h.stop().await;
    }

    #[tokio::test]
    #[traced_test]
    async fn selection_dispatches_event_then_acks() {
        let mut h = Harness::start();
        h.send(Command::SelectCancel, 0x11, &[0x00, 0x07]).await;
        let reply = h.recv().await;
        assert_eq!(Command::try_from(reply.cmd), Ok(Command::Ack));
        assert_eq!(reply.seq, 0x11);
        match h.events.recv_async().await.unwrap() {
            LinkEvent::Select { selection, seq } => {
                assert_eq!(selection, 7);
                assert_eq!(seq, 0x11);
            }
            other => panic!("unexpected event {other:?}"),
        }
        h.stop().await;
    }

    #[tokio::test]
    #[traced_test]
    async fn cancel_and_dispense_events() {
        let mut h = Harness::start();
        h.send(Command::SelectCancel, 0x12, &[0x00, 0x00]).await;
        let _ack = h.recv().await;
        assert!(matches!(
            h.events.recv_async().await.unwrap(),
            LinkEvent::Cancel { seq: 0x12 }
        ));

        h.send(Command::DispensingStatus, 0x13, &[0x02, 0x00, 0x07])
            .await;
        let _ack = h.recv().await;
        match h.events.recv_async().await.unwrap() {
            LinkEvent::Dispense { report, .. } => {
                assert!(report.status.is_success());
                assert_eq!(report.selection, Some(7));
            }
            other => panic!("unexpected event {other:?}"),
        }
        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn prolonged_silence_ends_the_connection() {
        let (mut session, _handle, _events) = LinkSession::new("unused");
        let (uc, _vmc) = tokio::io::duplex(64);
        let shutdown = Shutdown::new();
        let mut sh = shutdown.handle();
        let exit = session.drive(uc, &mut sh).await.unwrap();
        assert!(matches!(exit, Exit::Unhealthy));
    }
}
