//! Double-buffered heat-map frames and their delivery to the host.
//!
//! Frames are captured by the touch task into a [`FrameRing`] of two slots
//! and drained by a [`HeatMapStreamer`] running on the streaming endpoint's
//! own task. The ring is split once into a [`FrameProducer`] and a
//! [`FrameConsumer`], so each side can only touch the slot its own counter
//! selects.

use core::cell::RefCell;
use core::sync::atomic::{AtomicU32, Ordering};

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex;
use st_touchpad_async::op::HEAT_MAP_FRAME_LEN;

/// Number of frame slots in the ring.
pub const RING_SLOTS: u32 = 2;

/// Size of a streamed packet: one flag byte followed by the frame.
pub const PACKET_LEN: usize = 1 + HEAT_MAP_FRAME_LEN;
/// Packet flag: the dome switch was pressed when the frame was captured.
pub const PACKET_FLAG_BUTTON: u8 = 1 << 0;

/// Size of the per-transfer header.
pub const HEADER_LEN: usize = 2;
/// Header flag: the payload starts a new frame.
pub const HEADER_FLAG_NEW_FRAME: u8 = 1 << 0;

/// Interrupt report flag: a frame is waiting to be streamed.
pub const INT_FLAG_FRAME_AVAILABLE: u8 = 1 << 0;

/// One frame as streamed to the host.
#[derive(Clone, PartialEq, Eq)]
pub struct HeatMapPacket {
    bytes: [u8; PACKET_LEN],
}

impl Default for HeatMapPacket {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for HeatMapPacket {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "HeatMapPacket(flags: {:#04x})", self.bytes[0])
    }
}

impl HeatMapPacket {
    /// An empty packet.
    pub const fn new() -> Self {
        Self {
            bytes: [0; PACKET_LEN],
        }
    }

    /// Packet flags.
    pub fn flags(&self) -> u8 {
        self.bytes[0]
    }

    /// Sets or clears [`PACKET_FLAG_BUTTON`].
    pub fn set_button(&mut self, pressed: bool) {
        if pressed {
            self.bytes[0] |= PACKET_FLAG_BUTTON;
        } else {
            self.bytes[0] &= !PACKET_FLAG_BUTTON;
        }
    }

    /// The frame pixels.
    pub fn frame(&self) -> &[u8] {
        &self.bytes[1..]
    }

    /// The frame pixels, for capturing into.
    pub fn frame_mut(&mut self) -> &mut [u8] {
        &mut self.bytes[1..]
    }

    /// The whole packet as it goes on the wire.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// Header sent in front of every payload transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Transfer index, incremented after every accepted header.
    pub index: u8,
    /// See [`HEADER_FLAG_NEW_FRAME`].
    pub flags: u8,
}

impl PacketHeader {
    /// Serializes the header.
    pub fn to_bytes(self) -> [u8; HEADER_LEN] {
        [self.index, self.flags]
    }
}

/// The one-byte report sent on the interrupt endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InterruptReport {
    /// See [`INT_FLAG_FRAME_AVAILABLE`].
    pub flags: u8,
}

impl InterruptReport {
    /// A report announcing whether a frame is waiting.
    pub fn frame_available(available: bool) -> Self {
        Self {
            flags: if available {
                INT_FLAG_FRAME_AVAILABLE
            } else {
                0
            },
        }
    }

    /// Whether [`INT_FLAG_FRAME_AVAILABLE`] is set.
    pub fn is_frame_available(&self) -> bool {
        self.flags & INT_FLAG_FRAME_AVAILABLE != 0
    }

    /// Serializes the report.
    pub fn to_bytes(self) -> [u8; 1] {
        [self.flags]
    }
}

/// Two frame slots with monotonically increasing producer and consumer
/// counters.
///
/// `produced - consumed` is always 0, 1 or 2. Counters wrap, so they are
/// only ever compared through their difference.
pub struct FrameRing<M: RawMutex> {
    slots: [Mutex<M, RefCell<HeatMapPacket>>; RING_SLOTS as usize],
    produced: AtomicU32,
    consumed: AtomicU32,
}

impl<M: RawMutex> Default for FrameRing<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: RawMutex> FrameRing<M> {
    /// An empty ring.
    pub const fn new() -> Self {
        Self {
            slots: [
                Mutex::new(RefCell::new(HeatMapPacket::new())),
                Mutex::new(RefCell::new(HeatMapPacket::new())),
            ],
            produced: AtomicU32::new(0),
            consumed: AtomicU32::new(0),
        }
    }

    /// Splits the ring into its two ends.
    ///
    /// Borrowing the ring mutably guarantees there is exactly one producer
    /// and one consumer at a time.
    pub fn split(&mut self) -> (FrameProducer<'_, M>, FrameConsumer<'_, M>) {
        let ring = &*self;
        (FrameProducer { ring }, FrameConsumer { ring })
    }

    /// Number of frames published and not yet consumed.
    pub fn depth(&self) -> u32 {
        let consumed = self.consumed.load(Ordering::Acquire);
        self.produced
            .load(Ordering::Acquire)
            .wrapping_sub(consumed)
    }

    fn slot(&self, counter: u32) -> &Mutex<M, RefCell<HeatMapPacket>> {
        &self.slots[(counter % RING_SLOTS) as usize]
    }
}

/// The capturing end of a [`FrameRing`].
pub struct FrameProducer<'a, M: RawMutex> {
    ring: &'a FrameRing<M>,
}

impl<M: RawMutex> FrameProducer<'_, M> {
    /// Whether both slots hold unread frames.
    pub fn is_full(&self) -> bool {
        self.ring.depth() >= RING_SLOTS
    }

    /// Whether the consumer has frames left to stream.
    pub fn is_pending(&self) -> bool {
        self.ring.depth() > 0
    }

    /// Number of frames published so far, wrapping.
    pub fn produced(&self) -> u32 {
        self.ring.produced.load(Ordering::Relaxed)
    }

    /// Copies `packet` into the next free slot and publishes it.
    ///
    /// Returns `false`, leaving the ring untouched, when both slots are
    /// still unread.
    pub fn publish(&mut self, packet: &HeatMapPacket) -> bool {
        if self.is_full() {
            return false;
        }
        let produced = self.ring.produced.load(Ordering::Relaxed);
        self.ring
            .slot(produced)
            .lock(|slot| slot.borrow_mut().clone_from(packet));
        self.ring
            .produced
            .store(produced.wrapping_add(1), Ordering::Release);
        true
    }
}

/// The streaming end of a [`FrameRing`].
pub struct FrameConsumer<'a, M: RawMutex> {
    ring: &'a FrameRing<M>,
}

impl<M: RawMutex> FrameConsumer<'_, M> {
    /// Whether a published frame is waiting.
    pub fn is_pending(&self) -> bool {
        self.ring.depth() > 0
    }

    /// Number of frames consumed so far, wrapping.
    pub fn consumed(&self) -> u32 {
        self.ring.consumed.load(Ordering::Relaxed)
    }

    /// Runs `f` on the oldest unread frame, if any.
    pub fn with_front<R>(&self, f: impl FnOnce(&HeatMapPacket) -> R) -> Option<R> {
        if !self.is_pending() {
            return None;
        }
        let consumed = self.ring.consumed.load(Ordering::Relaxed);
        Some(self.ring.slot(consumed).lock(|slot| f(&slot.borrow())))
    }

    /// Hands the oldest frame's slot back to the producer.
    pub fn release(&mut self) {
        if !self.is_pending() {
            return;
        }
        let consumed = self.ring.consumed.load(Ordering::Relaxed);
        self.ring
            .consumed
            .store(consumed.wrapping_add(1), Ordering::Release);
    }
}

/// The isochronous endpoint frames are written to.
pub trait IsoSink {
    /// Error type of a rejected write.
    type Error: core::fmt::Debug;

    /// Writes `data` at `offset` into the endpoint's current packet and,
    /// when `commit` is set, hands the packet to the host.
    ///
    /// Returns the number of bytes accepted, which may be fewer than
    /// `data.len()`.
    fn write_packet(&mut self, data: &[u8], offset: usize, commit: bool)
        -> Result<usize, Self::Error>;
}

/// Reasons a transfer did not go out.
pub enum StreamError<E> {
    /// The endpoint took only part of the header.
    HeaderRejected,
    /// The endpoint refused the write.
    Sink(E),
}

impl<E: core::fmt::Debug> core::fmt::Debug for StreamError<E> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::HeaderRejected => write!(f, "HeaderRejected"),
            Self::Sink(err) => write!(f, "Sink({err:?})"),
        }
    }
}

/// Outcome of one successful transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sent {
    /// Nothing was waiting.
    Idle,
    /// Part of a frame went out.
    Partial,
    /// The last bytes of a frame went out and its slot was released.
    Completed,
}

/// Streams frames from a [`FrameConsumer`] to an [`IsoSink`].
pub struct HeatMapStreamer<'a, M: RawMutex> {
    consumer: FrameConsumer<'a, M>,
    index: u8,
    offset: usize,
}

impl<'a, M: RawMutex> HeatMapStreamer<'a, M> {
    /// Creates a streamer draining `consumer`.
    pub fn new(consumer: FrameConsumer<'a, M>) -> Self {
        Self {
            consumer,
            index: 0,
            offset: 0,
        }
    }

    /// Whether a frame is waiting or partially sent.
    pub fn is_pending(&self) -> bool {
        self.consumer.is_pending()
    }

    /// Offset of the next payload byte in the current frame.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// The interrupt report matching the ring state.
    pub fn report(&self) -> InterruptReport {
        InterruptReport::frame_available(self.is_pending())
    }

    /// Sends one header plus as much of the current frame as the endpoint
    /// takes.
    ///
    /// The header must be accepted whole. Payload bytes the endpoint leaves
    /// are sent by the next call.
    pub fn send_packet<S: IsoSink>(&mut self, sink: &mut S) -> Result<Sent, StreamError<S::Error>> {
        // The slot stays unlocked while the endpoint is written.
        let Some(packet) = self.consumer.with_front(HeatMapPacket::clone) else {
            return Ok(Sent::Idle);
        };
        let header = PacketHeader {
            index: self.index,
            flags: if self.offset == 0 { HEADER_FLAG_NEW_FRAME } else { 0 },
        };
        let accepted = sink
            .write_packet(&header.to_bytes(), 0, false)
            .map_err(StreamError::Sink)?;
        if accepted != HEADER_LEN {
            return Err(StreamError::HeaderRejected);
        }
        self.index = self.index.wrapping_add(1);

        let accepted = sink
            .write_packet(&packet.as_bytes()[self.offset..], HEADER_LEN, true)
            .map_err(StreamError::Sink)?;
        self.offset += accepted;
        log::trace!("heatmap::sent {accepted} bytes, offset {}", self.offset);

        if self.offset >= PACKET_LEN {
            self.offset = 0;
            self.consumer.release();
            return Ok(Sent::Completed);
        }
        Ok(Sent::Partial)
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use embassy_sync::blocking_mutex::raw::{CriticalSectionRawMutex, NoopRawMutex};
    use std::vec::Vec;

    use super::*;

    #[derive(Default)]
    struct FakeSink {
        header_room: Option<usize>,
        payload_room: Option<usize>,
        refuse: u32,
        writes: Vec<(Vec<u8>, usize, bool)>,
        delivered: Vec<u8>,
    }

    impl IsoSink for FakeSink {
        type Error = ();

        fn write_packet(&mut self, data: &[u8], offset: usize, commit: bool) -> Result<usize, ()> {
            if self.refuse > 0 {
                self.refuse -= 1;
                return Err(());
            }
            let room = if offset == 0 {
                self.header_room
            } else {
                self.payload_room
            };
            let n = room.unwrap_or(data.len()).min(data.len());
            self.writes.push((data[..n].to_vec(), offset, commit));
            if offset != 0 {
                self.delivered.extend_from_slice(&data[..n]);
            }
            Ok(n)
        }
    }

    fn packet(tag: u8) -> HeatMapPacket {
        let mut packet = HeatMapPacket::new();
        packet.frame_mut()[0] = tag;
        packet.frame_mut()[HEAT_MAP_FRAME_LEN - 1] = tag;
        packet
    }

    #[test]
    fn producer_stops_at_two_unread_frames() {
        let mut ring = FrameRing::<NoopRawMutex>::new();
        let (mut producer, mut consumer) = ring.split();

        assert!(producer.publish(&packet(1)));
        assert!(producer.publish(&packet(2)));
        assert!(producer.is_full());
        assert!(!producer.publish(&packet(3)));

        assert_eq!(consumer.with_front(|p| p.frame()[0]), Some(1));
        consumer.release();
        assert!(producer.publish(&packet(3)));
        assert_eq!(consumer.with_front(|p| p.frame()[0]), Some(2));
        consumer.release();
        assert_eq!(consumer.with_front(|p| p.frame()[0]), Some(3));
        consumer.release();
        assert_eq!(consumer.with_front(|p| p.frame()[0]), None);

        // Releasing an empty ring is a no-op.
        consumer.release();
        assert_eq!(producer.produced(), consumer.consumed());
    }

    #[test]
    fn random_interleavings_keep_the_depth_bounded() {
        let mut ring = FrameRing::<NoopRawMutex>::new();
        let (mut producer, consumer) = ring.split();
        let mut streamer = HeatMapStreamer::new(consumer);
        let mut sink = FakeSink::default();

        let mut seed = 0x2545_F491u32;
        let mut next = move || {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            seed
        };

        let mut captured = Vec::new();
        let mut tag = 0u8;
        for _ in 0..5000 {
            let roll = next();
            if roll % 3 == 0 {
                tag = tag.wrapping_add(1);
                if producer.publish(&packet(tag)) {
                    captured.push(tag);
                }
            } else {
                sink.payload_room = Some((roll % 200) as usize + 1);
                streamer.send_packet(&mut sink).unwrap();
            }
            let depth = producer.produced().wrapping_sub(streamer.consumer.consumed());
            assert!(depth <= RING_SLOTS);
        }

        // Every published frame came out whole and in order.
        let frames: Vec<&[u8]> = sink.delivered.chunks(PACKET_LEN).collect();
        for (frame, tag) in frames.iter().zip(&captured) {
            if frame.len() == PACKET_LEN {
                assert_eq!(frame[1], *tag);
                assert_eq!(frame[PACKET_LEN - 1], *tag);
            }
        }
    }

    #[test]
    fn partial_writes_resume_at_the_accepted_offset() {
        let mut ring = FrameRing::<NoopRawMutex>::new();
        let (mut producer, consumer) = ring.split();
        let mut streamer = HeatMapStreamer::new(consumer);
        let mut sink = FakeSink {
            payload_room: Some(200),
            ..Default::default()
        };

        assert_eq!(streamer.send_packet(&mut sink).unwrap(), Sent::Idle);
        assert!(sink.writes.is_empty());

        let mut frame = packet(7);
        frame.set_button(true);
        producer.publish(&frame);

        assert_eq!(streamer.send_packet(&mut sink).unwrap(), Sent::Partial);
        assert_eq!(streamer.offset(), 200);
        assert_eq!(streamer.send_packet(&mut sink).unwrap(), Sent::Partial);
        assert_eq!(streamer.send_packet(&mut sink).unwrap(), Sent::Completed);
        assert_eq!(streamer.offset(), 0);
        assert!(!streamer.is_pending());

        let headers: Vec<_> = sink.writes.iter().filter(|w| w.1 == 0).collect();
        assert_eq!(headers[0].0, [0, HEADER_FLAG_NEW_FRAME]);
        assert_eq!(headers[1].0, [1, 0]);
        assert_eq!(headers[2].0, [2, 0]);
        assert!(headers.iter().all(|h| !h.2));

        let payloads: Vec<_> = sink.writes.iter().filter(|w| w.1 != 0).collect();
        assert!(payloads.iter().all(|p| p.1 == HEADER_LEN && p.2));
        assert_eq!(sink.delivered, frame.as_bytes());
        assert_eq!(sink.delivered[0], PACKET_FLAG_BUTTON);
    }

    #[test]
    fn truncated_header_sends_no_payload() {
        let mut ring = FrameRing::<NoopRawMutex>::new();
        let (mut producer, consumer) = ring.split();
        let mut streamer = HeatMapStreamer::new(consumer);
        producer.publish(&packet(1));

        let mut sink = FakeSink {
            header_room: Some(1),
            ..Default::default()
        };
        assert!(matches!(
            streamer.send_packet(&mut sink),
            Err(StreamError::HeaderRejected)
        ));
        assert_eq!(sink.writes.len(), 1);
        assert!(streamer.is_pending());

        // The index only moves on accepted headers.
        sink.header_room = None;
        streamer.send_packet(&mut sink).unwrap();
        assert_eq!(sink.writes[1].0, [0, HEADER_FLAG_NEW_FRAME]);
    }

    /// Writes only if another thread can take the critical section
    /// meanwhile.
    struct ContendedSink {
        writes: usize,
    }

    impl IsoSink for ContendedSink {
        type Error = ();

        fn write_packet(&mut self, data: &[u8], _offset: usize, _commit: bool) -> Result<usize, ()> {
            let (tx, rx) = std::sync::mpsc::channel();
            std::thread::spawn(move || critical_section::with(|_| tx.send(()).ok()));
            rx.recv_timeout(std::time::Duration::from_secs(1))
                .map_err(|_| ())?;
            self.writes += 1;
            Ok(data.len())
        }
    }

    #[test]
    fn slot_lock_is_released_during_endpoint_writes() {
        let mut ring = FrameRing::<CriticalSectionRawMutex>::new();
        let (mut producer, consumer) = ring.split();
        let mut streamer = HeatMapStreamer::new(consumer);
        producer.publish(&packet(4));

        let mut sink = ContendedSink { writes: 0 };
        assert_eq!(streamer.send_packet(&mut sink).unwrap(), Sent::Completed);
        assert_eq!(sink.writes, 2);
    }

    #[test]
    fn interrupt_report_tracks_pending_frames() {
        let mut ring = FrameRing::<NoopRawMutex>::new();
        let (mut producer, consumer) = ring.split();
        let mut streamer = HeatMapStreamer::new(consumer);
        assert_eq!(streamer.report().to_bytes(), [0]);

        producer.publish(&packet(1));
        assert!(streamer.report().is_frame_available());

        streamer.send_packet(&mut FakeSink::default()).unwrap();
        assert_eq!(streamer.report(), InterruptReport::default());
    }
}
