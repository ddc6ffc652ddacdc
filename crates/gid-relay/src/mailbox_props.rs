use proptest::prelude::*;
use crate::mailbox::{Envelope, Mailbox, MailboxError};
use gid_wire::Frame;

fn envelope(sender: &str, blob: &str) -> Envelope {
    Envelope::new(Frame::Incoming {
        sender: sender.to_string(),
        blob: blob.to_string(),
    })
    .unwrap()
}

proptest! {
    // Drain returns exactly what was enqueued, in order
    #[test]
    fn test_ordering_and_sequence(
        blobs in prop::collection::vec("[a-zA-Z0-9+/=]{1,64}", 1..30)
    ) {
        let mut mailbox = Mailbox::new(100, 1024);
        let mut seqs = Vec::new();
        for b in &blobs {
            seqs.push(mailbox.enqueue("AGENT-B", envelope("AGENT-A", b)).unwrap());
        }

        let drained = mailbox.drain("AGENT-B");
        prop_assert_eq!(drained.len(), blobs.len());
        for (i, env) in drained.iter().enumerate() {
            prop_assert_eq!(env.sequence, seqs[i]);
            match &env.frame {
                Frame::Incoming { blob, .. } => prop_assert_eq!(blob, &blobs[i]),
                other => prop_assert!(false, "unexpected frame {:?}", other),
            }
        }
        prop_assert!(seqs.windows(2).all(|w| w[0] < w[1]));
        prop_assert_eq!(mailbox.total_queued(), 0);
    }

    // Interleaved recipients never see each other's envelopes
    #[test]
    fn test_recipient_isolation(
        targets in prop::collection::vec(0usize..4, 1..40)
    ) {
        let mut mailbox = Mailbox::new(100, 1024);
        for (i, t) in targets.iter().enumerate() {
            mailbox.enqueue(&format!("AGENT-{t}"), envelope(&format!("AGENT-{t}"), &i.to_string())).unwrap();
        }
        for t in 0..4usize {
            let id = format!("AGENT-{t}");
            let expected: Vec<String> = targets
                .iter()
                .enumerate()
                .filter(|(_, x)| **x == t)
                .map(|(i, _)| i.to_string())
                .collect();
            let got: Vec<String> = mailbox
                .drain(&id)
                .into_iter()
                .map(|e| match e.frame {
                    Frame::Incoming { sender, blob } => {
                        assert_eq!(sender, id);
                        blob
                    }
                    other => panic!("unexpected frame {other:?}"),
                })
                .collect();
            prop_assert_eq!(got, expected);
        }
    }

    // Queue length enforcement
    #[test]
    fn test_queue_limit_enforcement(
        limit in 1..20usize,
        extras in 1..10usize
    ) {
        let mut mailbox = Mailbox::new(limit, 1024);

        for i in 0..limit {
            prop_assert!(mailbox.enqueue("AGENT-B", envelope("AGENT-A", &i.to_string())).is_ok());
        }

        for _ in 0..extras {
            prop_assert!(matches!(
                mailbox.enqueue("AGENT-B", envelope("AGENT-A", "x")),
                Err(MailboxError::QueueFull)
            ));
        }
        prop_assert_eq!(mailbox.queue_length("AGENT-B"), limit);
    }
}
