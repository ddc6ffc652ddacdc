use std::collections::{HashMap, VecDeque};

use gid_wire::{Frame, WireError};

/// A frame held for an offline recipient.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub frame: Frame,
    /// Encoded body length, checked against `max_envelope_size`.
    pub size: usize,
    pub sequence: u64,
}

impl Envelope {
    /// Wrap `frame`, measuring its encoded size.
    pub fn new(frame: Frame) -> Result<Self, WireError> {
        let size = frame.encode()?.len();
        Ok(Self {
            frame,
            size,
            sequence: 0,
        })
    }
}

/// Per-recipient FIFO queues of undelivered envelopes.
#[derive(Debug)]
pub struct Mailbox {
    queues: HashMap<String, VecDeque<Envelope>>,
    next_sequence: u64,
    max_queue_length: usize,
    max_envelope_size: usize,
}

impl Mailbox {
    pub fn new(max_queue_length: usize, max_envelope_size: usize) -> Self {
        Self {
            queues: HashMap::new(),
            next_sequence: 1,
            max_queue_length,
            max_envelope_size,
        }
    }

    pub fn enqueue(&mut self, recipient: &str, mut envelope: Envelope) -> Result<u64, MailboxError> {
        if envelope.size > self.max_envelope_size {
            return Err(MailboxError::TooLarge);
        }

        let queue = self.queues.entry(recipient.to_string()).or_default();
        if queue.len() >= self.max_queue_length {
            return Err(MailboxError::QueueFull);
        }

        let sequence = self.next_sequence;
        self.next_sequence += 1;
        envelope.sequence = sequence;
        queue.push_back(envelope);

        Ok(sequence)
    }

    /// Remove and return everything queued for `agent_id`, oldest first.
    pub fn drain(&mut self, agent_id: &str) -> Vec<Envelope> {
        self.queues
            .remove(agent_id)
            .map(Vec::from)
            .unwrap_or_default()
    }

    /// Put drained envelopes that could not be delivered back at the head,
    /// ahead of anything enqueued since, keeping their order.
    ///
    /// Limits are not applied: these envelopes were already accepted once.
    pub fn requeue_front(&mut self, agent_id: &str, envelopes: Vec<Envelope>) {
        if envelopes.is_empty() {
            return;
        }
        let queue = self.queues.entry(agent_id.to_string()).or_default();
        for envelope in envelopes.into_iter().rev() {
            queue.push_front(envelope);
        }
    }

    pub fn queue_length(&self, agent_id: &str) -> usize {
        self.queues.get(agent_id).map_or(0, VecDeque::len)
    }

    pub fn total_queued(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MailboxError {
    #[error("envelope too large")]
    TooLarge,
    #[error("queue full")]
    QueueFull,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn incoming(n: usize) -> Envelope {
        Envelope::new(Frame::Incoming {
            sender: "AGENT-A".into(),
            blob: format!("blob-{n}"),
        })
        .unwrap()
    }

    fn blob_of(envelope: &Envelope) -> &str {
        match &envelope.frame {
            Frame::Incoming { blob, .. } => blob,
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn test_drain_is_fifo_and_empties() {
        let mut mailbox = Mailbox::new(10, 1024);
        for i in 0..3 {
            mailbox.enqueue("AGENT-B", incoming(i)).unwrap();
        }
        assert_eq!(mailbox.queue_length("AGENT-B"), 3);

        let drained = mailbox.drain("AGENT-B");
        let blobs: Vec<_> = drained.iter().map(blob_of).collect();
        assert_eq!(blobs, vec!["blob-0", "blob-1", "blob-2"]);

        assert_eq!(mailbox.queue_length("AGENT-B"), 0);
        assert!(mailbox.drain("AGENT-B").is_empty());
    }

    #[test]
    fn test_queues_are_per_recipient() {
        let mut mailbox = Mailbox::new(10, 1024);
        mailbox.enqueue("AGENT-B", incoming(0)).unwrap();
        mailbox.enqueue("AGENT-C", incoming(1)).unwrap();
        assert_eq!(mailbox.total_queued(), 2);
        assert_eq!(mailbox.drain("AGENT-C").len(), 1);
        assert_eq!(mailbox.queue_length("AGENT-B"), 1);
    }

    #[test]
    fn test_limits() {
        let mut mailbox = Mailbox::new(1, 1024);
        mailbox.enqueue("AGENT-B", incoming(0)).unwrap();
        assert_eq!(mailbox.enqueue("AGENT-B", incoming(1)), Err(MailboxError::QueueFull));

        let mut tiny = Mailbox::new(10, 4);
        assert_eq!(tiny.enqueue("AGENT-B", incoming(0)), Err(MailboxError::TooLarge));
        assert_eq!(tiny.total_queued(), 0);
    }

    #[test]
    fn test_requeue_front_preserves_order() {
        let mut mailbox = Mailbox::new(10, 1024);
        for i in 0..3 {
            mailbox.enqueue("AGENT-B", incoming(i)).unwrap();
        }
        let mut drained = mailbox.drain("AGENT-B");
        // First one went out, the rest failed
        let undelivered = drained.split_off(1);

        mailbox.enqueue("AGENT-B", incoming(3)).unwrap();
        mailbox.requeue_front("AGENT-B", undelivered);

        let blobs: Vec<_> = mailbox.drain("AGENT-B").iter().map(|e| blob_of(e).to_string()).collect();
        assert_eq!(blobs, vec!["blob-1", "blob-2", "blob-3"]);
    }
}
