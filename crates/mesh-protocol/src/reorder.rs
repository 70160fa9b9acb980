use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::packets::MidiPacket;

/// Counters accumulated by one reorder buffer over its lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReorderStats {
    /// Packets handed out in order
    pub delivered: u64,
    /// Late or duplicate arrivals discarded
    pub duplicates: u64,
    /// Buffered packets evicted because the pending map hit capacity
    pub evicted: u64,
    /// Sequence numbers abandoned by a forced skip-ahead
    pub skipped: u64,
}

/// Per-connection reorder buffer: turns the unordered datagram stream into
/// an in-order delivery stream.
///
/// Packets at the expected sequence are delivered immediately; later ones
/// are parked in a bounded sorted map. A gap that persists past the skip
/// timeout forces the cursor forward to the oldest parked packet, trading
/// strict ordering for forward progress — memory stays bounded under
/// sustained loss.
pub struct ReorderBuffer {
    /// Next sequence number to deliver. Senders start at 0.
    expected: u32,
    pending: BTreeMap<u32, MidiPacket>,
    capacity: usize,
    skip_after: Duration,
    /// Set when delivery first stalls behind a gap, cleared on progress.
    gap_since: Option<Instant>,
    stats: ReorderStats,
}

impl ReorderBuffer {
    pub fn new(capacity: usize, skip_after: Duration) -> Self {
        Self {
            expected: 0,
            pending: BTreeMap::new(),
            capacity: capacity.max(1),
            skip_after,
            gap_since: None,
            stats: ReorderStats::default(),
        }
    }

    /// Accept one packet from the wire. Returns every packet that became
    /// deliverable, in order.
    pub fn offer(&mut self, packet: MidiPacket, now: Instant) -> Vec<MidiPacket> {
        if packet.sequence < self.expected {
            self.stats.duplicates += 1;
            return Vec::new();
        }

        if packet.sequence == self.expected {
            let mut out = Vec::with_capacity(1 + self.pending.len());
            self.expected = self.expected.wrapping_add(1);
            self.stats.delivered += 1;
            out.push(packet);
            self.drain_contiguous(&mut out);
            self.update_gap_timer(now);
            return out;
        }

        // Future packet — park it. Replacing an already-buffered sequence
        // counts the newcomer as a duplicate.
        if self.pending.contains_key(&packet.sequence) {
            self.stats.duplicates += 1;
            return Vec::new();
        }

        if self.pending.len() >= self.capacity {
            // Oldest buffered entry goes first
            if let Some((&oldest, _)) = self.pending.iter().next() {
                self.pending.remove(&oldest);
                self.stats.evicted += 1;
            }
        }
        self.pending.insert(packet.sequence, packet);

        if self.gap_since.is_none() {
            self.gap_since = Some(now);
        }
        Vec::new()
    }

    /// Force progress past a gap that has outlived the skip timeout.
    /// Returns the packets released by the skip, in order.
    pub fn flush_expired(&mut self, now: Instant) -> Vec<MidiPacket> {
        let Some(since) = self.gap_since else {
            return Vec::new();
        };
        if now.saturating_duration_since(since) < self.skip_after || self.pending.is_empty() {
            return Vec::new();
        }

        let oldest = *self.pending.keys().next().unwrap_or(&self.expected);
        self.stats.skipped += u64::from(oldest - self.expected);
        self.expected = oldest;

        let mut out = Vec::new();
        self.drain_contiguous(&mut out);
        self.update_gap_timer(now);
        out
    }

    /// Discard everything pending (connection close).
    pub fn clear(&mut self) {
        self.pending.clear();
        self.gap_since = None;
    }

    pub fn expected(&self) -> u32 {
        self.expected
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn stats(&self) -> ReorderStats {
        self.stats
    }

    fn drain_contiguous(&mut self, out: &mut Vec<MidiPacket>) {
        while let Some(packet) = self.pending.remove(&self.expected) {
            self.expected = self.expected.wrapping_add(1);
            self.stats.delivered += 1;
            out.push(packet);
        }
    }

    fn update_gap_timer(&mut self, now: Instant) {
        self.gap_since = if self.pending.is_empty() {
            None
        } else {
            Some(now)
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::NodeId;

    fn packet(seq: u32) -> MidiPacket {
        MidiPacket {
            sequence: seq,
            source: NodeId::from_bytes([1; 16]),
            dest_node: NodeId::from_bytes([2; 16]),
            dest_device: 0,
            timestamp_us: 0,
            payload: vec![0x90, seq as u8 & 0x7F, 0x64],
        }
    }

    fn seqs(packets: &[MidiPacket]) -> Vec<u32> {
        packets.iter().map(|p| p.sequence).collect()
    }

    #[test]
    fn in_order_stream_passes_through() {
        let mut buf = ReorderBuffer::new(16, Duration::from_secs(3));
        let now = Instant::now();
        for seq in 0..5 {
            let out = buf.offer(packet(seq), now);
            assert_eq!(seqs(&out), vec![seq]);
        }
        assert_eq!(buf.stats().delivered, 5);
        assert_eq!(buf.pending_len(), 0);
    }

    #[test]
    fn out_of_order_arrivals_are_resequenced() {
        let mut buf = ReorderBuffer::new(16, Duration::from_secs(3));
        let now = Instant::now();

        assert!(buf.offer(packet(2), now).is_empty());
        assert!(buf.offer(packet(1), now).is_empty());
        let out = buf.offer(packet(0), now);
        assert_eq!(seqs(&out), vec![0, 1, 2]);
    }

    #[test]
    fn any_permutation_delivers_in_order() {
        // A handful of fixed permutations of 0..6
        let permutations: [[u32; 6]; 4] = [
            [5, 4, 3, 2, 1, 0],
            [3, 0, 5, 1, 4, 2],
            [1, 0, 3, 2, 5, 4],
            [2, 5, 0, 4, 1, 3],
        ];
        for perm in permutations {
            let mut buf = ReorderBuffer::new(16, Duration::from_secs(3));
            let now = Instant::now();
            let mut delivered = Vec::new();
            for seq in perm {
                delivered.extend(seqs(&buf.offer(packet(seq), now)));
            }
            assert_eq!(delivered, vec![0, 1, 2, 3, 4, 5], "perm {:?}", perm);
        }
    }

    #[test]
    fn late_and_duplicate_arrivals_discarded() {
        let mut buf = ReorderBuffer::new(16, Duration::from_secs(3));
        let now = Instant::now();

        buf.offer(packet(0), now);
        buf.offer(packet(1), now);

        assert!(buf.offer(packet(0), now).is_empty()); // late
        assert!(buf.offer(packet(3), now).is_empty()); // parked
        assert!(buf.offer(packet(3), now).is_empty()); // duplicate of parked
        assert_eq!(buf.stats().duplicates, 2);
    }

    #[test]
    fn capacity_evicts_oldest_buffered() {
        let mut buf = ReorderBuffer::new(3, Duration::from_secs(3));
        let now = Instant::now();

        // Nothing delivered yet (waiting on 0); park 3 then overflow
        for seq in [1u32, 2, 3] {
            assert!(buf.offer(packet(seq), now).is_empty());
        }
        assert!(buf.offer(packet(4), now).is_empty());
        assert_eq!(buf.pending_len(), 3);
        assert_eq!(buf.stats().evicted, 1);

        // Seq 1 was evicted: delivering 0 drains only 0, then the gap at 1
        let out = buf.offer(packet(0), now);
        assert_eq!(seqs(&out), vec![0]);
    }

    #[test]
    fn gap_skip_ahead_after_timeout() {
        let mut buf = ReorderBuffer::new(16, Duration::from_millis(100));
        let start = Instant::now();

        buf.offer(packet(0), start);
        // 1 is lost; 2 and 3 park
        assert!(buf.offer(packet(2), start).is_empty());
        assert!(buf.offer(packet(3), start).is_empty());

        // Not yet expired
        assert!(buf.flush_expired(start + Duration::from_millis(50)).is_empty());

        // Expired: cursor jumps to 2 and releases the parked run
        let out = buf.flush_expired(start + Duration::from_millis(150));
        assert_eq!(seqs(&out), vec![2, 3]);
        assert_eq!(buf.stats().skipped, 1);
        assert_eq!(buf.expected(), 4);

        // Straggler 1 now reads as late
        assert!(buf.offer(packet(1), start + Duration::from_millis(200)).is_empty());
        assert_eq!(buf.stats().duplicates, 1);
    }

    #[test]
    fn progress_resets_gap_timer() {
        let mut buf = ReorderBuffer::new(16, Duration::from_millis(100));
        let start = Instant::now();

        assert!(buf.offer(packet(1), start).is_empty());
        // Gap fills before the timeout — no skip should ever fire
        let out = buf.offer(packet(0), start + Duration::from_millis(50));
        assert_eq!(seqs(&out), vec![0, 1]);
        assert!(buf
            .flush_expired(start + Duration::from_millis(500))
            .is_empty());
        assert_eq!(buf.stats().skipped, 0);
    }

    #[test]
    fn clear_discards_pending() {
        let mut buf = ReorderBuffer::new(16, Duration::from_secs(3));
        let now = Instant::now();
        buf.offer(packet(1), now);
        buf.offer(packet(2), now);
        buf.clear();
        assert_eq!(buf.pending_len(), 0);
        assert!(buf.flush_expired(now + Duration::from_secs(10)).is_empty());
    }
}
