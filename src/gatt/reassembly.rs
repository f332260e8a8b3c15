//! Prepared-write reassembly.
//!
//! The peer can provision values larger than a single ATT write by sending
//! a sequence of prepared writes, each carrying an offset, followed by an
//! execute-write. Fragments are overlaid into a bounded buffer; the buffer
//! is reset on commit, on cancel and on disconnect so no stale content is
//! ever observable to the next operation.

use log::warn;

/// Fixed capacity of the reassembly buffer in bytes.
pub const PREPARE_BUF_CAPACITY: usize = 1024;

/// ATT-level status codes returned to the peer in write responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    /// Write applied.
    Success,
    /// Fragment would exceed the reassembly capacity.
    InvalidLength,
    /// Acknowledgement buffer could not be allocated.
    InsufficientResources,
    /// Write targeted an attribute we do not own.
    NotPermitted,
}

/// Per-fragment acknowledgement echoed back to the peer.
///
/// Prepared writes are acknowledged individually; the peer verifies the
/// echo before sending the next fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentAck {
    /// Attribute handle the fragment targeted.
    pub handle: u16,
    /// Offset the fragment was written at.
    pub offset: u16,
    /// Copy of the fragment payload.
    pub value: Vec<u8>,
}

/// Outcome of submitting one fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Fragment applied; the ack must be sent if the peer asked for a
    /// response.
    Accepted(FragmentAck),
    /// Fragment rejected; the status must still be sent to the peer and
    /// the fragment must not be applied.
    Rejected(WriteStatus),
}

/// Bounded overlay buffer for one in-flight prepared-write sequence.
///
/// At most one instance is live per peer link. Storage is allocated lazily
/// on the first fragment and kept until [`reset`](Self::reset).
pub struct PrepareBuffer {
    bytes: Vec<u8>,
    written: usize,
}

impl PrepareBuffer {
    /// Create an empty buffer. No storage is allocated until the first
    /// fragment arrives.
    pub fn new() -> Self {
        Self {
            bytes: Vec::new(),
            written: 0,
        }
    }

    /// Overlay one fragment at `offset`.
    ///
    /// Bounds are checked before any copy: a fragment with
    /// `offset + len > PREPARE_BUF_CAPACITY` is rejected with
    /// [`WriteStatus::InvalidLength`] and the buffer keeps its prior state.
    pub fn submit(&mut self, handle: u16, offset: usize, data: &[u8]) -> SubmitOutcome {
        let end = match offset.checked_add(data.len()) {
            Some(end) if end <= PREPARE_BUF_CAPACITY => end,
            _ => {
                warn!(
                    "prepared write rejected: offset {} + len {} exceeds capacity {}",
                    offset,
                    data.len(),
                    PREPARE_BUF_CAPACITY
                );
                return SubmitOutcome::Rejected(WriteStatus::InvalidLength);
            }
        };

        if self.bytes.is_empty() {
            if self.bytes.try_reserve_exact(PREPARE_BUF_CAPACITY).is_err() {
                warn!("prepared write rejected: reassembly buffer allocation failed");
                return SubmitOutcome::Rejected(WriteStatus::InsufficientResources);
            }
            self.bytes.resize(PREPARE_BUF_CAPACITY, 0);
        }

        // Ack echo is allocated before the copy so a failed allocation
        // leaves the buffer untouched.
        let mut echo = Vec::new();
        if echo.try_reserve_exact(data.len()).is_err() {
            warn!("prepared write rejected: ack buffer allocation failed");
            return SubmitOutcome::Rejected(WriteStatus::InsufficientResources);
        }
        echo.extend_from_slice(data);

        self.bytes[offset..end].copy_from_slice(data);
        self.written = self.written.max(end);

        SubmitOutcome::Accepted(FragmentAck {
            handle,
            offset: offset as u16,
            value: echo,
        })
    }

    /// Take the reassembled content (`bytes[0..written_len]`) and reset.
    ///
    /// Returns `None` if nothing was written since the last reset.
    pub fn take_committed(&mut self) -> Option<Vec<u8>> {
        if self.written == 0 {
            self.reset();
            return None;
        }
        let content = self.bytes[..self.written].to_vec();
        self.reset();
        Some(content)
    }

    /// Drop any partial state. Called on execute-cancel and on disconnect.
    pub fn reset(&mut self) {
        self.bytes.clear();
        self.bytes.shrink_to_fit();
        self.written = 0;
    }

    /// Cumulative bytes written since the last reset.
    pub fn written_len(&self) -> usize {
        self.written
    }

    /// True if no fragment has been accepted since the last reset.
    pub fn is_empty(&self) -> bool {
        self.written == 0
    }
}

impl Default for PrepareBuffer {
    fn default() -> Self {
        Self::new()
    }
}
