//! Remote ICE candidate bookkeeping

use std::collections::HashSet;

use crate::signaling::protocol::CandidateKey;
use crate::signaling::IceCandidate;

/// What to do with an incoming remote candidate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Already seen; drop it
    Duplicate,
    /// The remote description is not set yet; held for later
    Buffered,
    /// Apply it now
    Apply(IceCandidate),
}

/// Deduplicates remote candidates and holds them until the remote
/// description is applied
#[derive(Debug, Default)]
pub struct CandidateBuffer {
    pending: Vec<IceCandidate>,
    seen: HashSet<CandidateKey>,
    ready: bool,
}

impl CandidateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn admit(&mut self, candidate: IceCandidate) -> Admission {
        if !self.seen.insert(candidate.key()) {
            return Admission::Duplicate;
        }
        if self.ready {
            Admission::Apply(candidate)
        } else {
            self.pending.push(candidate);
            Admission::Buffered
        }
    }

    /// Mark the remote description as applied and hand over everything
    /// buffered so far, in arrival order. Later calls return nothing.
    pub fn release(&mut self) -> Vec<IceCandidate> {
        self.ready = true;
        std::mem::take(&mut self.pending)
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Number of distinct candidates admitted so far
    pub fn seen_len(&self) -> usize {
        self.seen.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(port: u16) -> IceCandidate {
        IceCandidate::new(
            format!("candidate:1 1 udp 2130706431 10.0.0.5 {} typ host", port),
            Some("0".to_string()),
            Some(0),
        )
    }

    #[test]
    fn test_buffers_until_ready() {
        let mut buffer = CandidateBuffer::new();
        assert_eq!(buffer.admit(candidate(5000)), Admission::Buffered);
        assert_eq!(buffer.admit(candidate(5001)), Admission::Buffered);
        assert_eq!(buffer.pending_len(), 2);

        let released = buffer.release();
        assert_eq!(released, vec![candidate(5000), candidate(5001)]);
        assert!(buffer.release().is_empty());

        assert_eq!(buffer.admit(candidate(5002)), Admission::Apply(candidate(5002)));
    }

    #[test]
    fn test_duplicates_dropped_before_and_after_release() {
        let mut buffer = CandidateBuffer::new();
        buffer.admit(candidate(5000));
        assert_eq!(buffer.admit(candidate(5000)), Admission::Duplicate);

        buffer.release();
        assert_eq!(buffer.admit(candidate(5000)), Admission::Duplicate);
        assert_eq!(buffer.seen_len(), 1);
    }
}
