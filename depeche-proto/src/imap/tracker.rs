use std::collections::HashSet;
use std::num::NonZeroU32;

use imap_codec::imap_types::sequence::{SeqOrUid, Sequence, SequenceSet};

use depeche_meta::model::{ModSeq, PollResult};

/// Per-session view of a selected mailbox.
///
/// IMAP sequence numbers are 1-based ranks into the set of messages the
/// *client* currently knows about; that set must not shift when another
/// session expunges something, only when this session is told about the
/// expunge. The tracker is therefore an ordered vector of UIDs: rank lookup
/// gives seq → uid, binary search gives uid → seq, and poll application
/// mutates the vector exactly in step with the responses it produces.
pub struct SessionTracker {
    uids: Vec<u32>,
    highest_modseq: ModSeq,
}

/// Response-worthy change derived from one poll, already translated into
/// the session's sequence numbering.
#[derive(Debug, PartialEq, Eq)]
pub enum TrackedChange {
    /// This sequence number disappeared from the client's view.
    Expunge(NonZeroU32),
    /// Flags changed for this (seq, uid).
    Flags(NonZeroU32, u32),
    /// The mailbox now holds this many messages.
    Exists(u32),
}

impl SessionTracker {
    pub fn new(uids: Vec<u32>, highest_modseq: ModSeq) -> Self {
        debug_assert!(uids.windows(2).all(|w| w[0] < w[1]));
        Self {
            uids,
            highest_modseq,
        }
    }

    pub fn len(&self) -> u32 {
        self.uids.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.uids.is_empty()
    }

    pub fn highest_modseq(&self) -> ModSeq {
        self.highest_modseq
    }

    pub fn max_uid(&self) -> Option<u32> {
        self.uids.last().copied()
    }

    pub fn seq_of_uid(&self, uid: u32) -> Option<NonZeroU32> {
        self.uids
            .binary_search(&uid)
            .ok()
            .map(|rank| NonZeroU32::new(rank as u32 + 1).unwrap())
    }

    pub fn uid_of_seq(&self, seq: NonZeroU32) -> Option<u32> {
        self.uids.get(seq.get() as usize - 1).copied()
    }

    fn remove_uid(&mut self, uid: u32) -> Option<NonZeroU32> {
        match self.uids.binary_search(&uid) {
            Ok(rank) => {
                self.uids.remove(rank);
                Some(NonZeroU32::new(rank as u32 + 1).unwrap())
            }
            Err(_) => None,
        }
    }

    fn insert_uid(&mut self, uid: u32) {
        if let Err(rank) = self.uids.binary_search(&uid) {
            self.uids.insert(rank, uid);
        }
    }

    /// Fold a poll result into the view. Returns the changes in the order
    /// they must reach the client: expunges and flag updates in modseq
    /// order, then a final EXISTS when the count grew. A shrinking count
    /// without matching expunges is logged and *not* propagated, since a
    /// spontaneous EXISTS decrease is not valid IMAP.
    pub fn apply_poll(&mut self, poll: PollResult, silence: &HashSet<u32>) -> Vec<TrackedChange> {
        let mut out = Vec::new();
        let before = self.len();
        let mut expunges = 0u32;

        for update in &poll.updates {
            if update.is_expunge {
                if let Some(seq) = self.remove_uid(update.uid) {
                    out.push(TrackedChange::Expunge(seq));
                    expunges += 1;
                }
            } else if let Some(seq) = self.seq_of_uid(update.uid) {
                if !silence.contains(&update.uid) {
                    out.push(TrackedChange::Flags(seq, update.uid));
                }
            } else {
                self.insert_uid(update.uid);
            }
        }

        let expected = before - expunges;
        if self.len() > expected {
            out.push(TrackedChange::Exists(self.len()));
        } else if poll.num_messages < expected && expunges == 0 {
            tracing::warn!(
                known = expected,
                actual = poll.num_messages,
                "mailbox shrank without expunge updates, not telling the client"
            );
        }

        self.highest_modseq = poll.highest_modseq;
        out
    }

    /// Client numset → UIDs, in this session's view. In UID mode unknown
    /// UIDs are silently dropped (they may be someone else's); in sequence
    /// mode out-of-range numbers are dropped the same way.
    pub fn decode_sequence_set(&self, set: &SequenceSet, by_uid: bool) -> Vec<u32> {
        // In sequence mode an empty view has nothing addressable, and `*`
        // would otherwise resolve to rank 0.
        if !by_uid && self.is_empty() {
            return Vec::new();
        }
        let mut out = Vec::new();
        for seq in set.0.as_ref() {
            let (lo, hi) = self.bounds(seq, by_uid);
            if by_uid {
                let start = self.uids.partition_point(|&u| u < lo);
                out.extend(self.uids[start..].iter().take_while(|&&u| u <= hi));
            } else {
                for rank in lo.max(1)..=hi {
                    if let Some(&uid) = self.uids.get(rank as usize - 1) {
                        out.push(uid);
                    }
                }
            }
        }
        out.sort_unstable();
        out.dedup();
        out
    }

    fn bounds(&self, seq: &Sequence, by_uid: bool) -> (u32, u32) {
        let star = if by_uid {
            self.max_uid().unwrap_or(0)
        } else {
            self.len()
        };
        let value = |s: &SeqOrUid| match s {
            SeqOrUid::Value(v) => v.get(),
            SeqOrUid::Asterisk => star,
        };
        match seq {
            Sequence::Single(s) => {
                let v = value(s);
                (v, v)
            }
            Sequence::Range(a, b) => {
                let (a, b) = (value(a), value(b));
                (a.min(b), a.max(b))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use depeche_meta::model::{FlagSet, PollUpdate};

    fn poll(num: u32, modseq: ModSeq, updates: Vec<PollUpdate>) -> PollResult {
        PollResult {
            num_messages: num,
            highest_modseq: modseq,
            updates,
        }
    }

    fn upd(uid: u32, is_expunge: bool, modseq: ModSeq) -> PollUpdate {
        PollUpdate {
            uid,
            flags: FlagSet::default(),
            is_expunge,
            modseq,
        }
    }

    #[test]
    fn rank_lookups() {
        let t = SessionTracker::new(vec![3, 7, 12], 5);
        assert_eq!(t.seq_of_uid(3), NonZeroU32::new(1));
        assert_eq!(t.seq_of_uid(12), NonZeroU32::new(3));
        assert_eq!(t.seq_of_uid(5), None);
        assert_eq!(t.uid_of_seq(NonZeroU32::new(2).unwrap()), Some(7));
        assert_eq!(t.uid_of_seq(NonZeroU32::new(4).unwrap()), None);
    }

    #[test]
    fn expunge_shifts_later_sequences() {
        let mut t = SessionTracker::new(vec![3, 7, 12], 5);
        let changes = t.apply_poll(
            poll(1, 8, vec![upd(7, true, 6), upd(12, true, 7)]),
            &HashSet::new(),
        );
        // uid 7 was seq 2; after its removal uid 12 is seq 2.
        assert_eq!(
            changes,
            vec![
                TrackedChange::Expunge(NonZeroU32::new(2).unwrap()),
                TrackedChange::Expunge(NonZeroU32::new(2).unwrap()),
            ]
        );
        assert_eq!(t.len(), 1);
        assert_eq!(t.highest_modseq(), 8);
    }

    #[test]
    fn new_messages_raise_exists() {
        let mut t = SessionTracker::new(vec![1], 2);
        let changes = t.apply_poll(poll(3, 5, vec![upd(2, false, 3), upd(3, false, 4)]), &HashSet::new());
        assert_eq!(changes, vec![TrackedChange::Exists(3)]);
        assert_eq!(t.seq_of_uid(3), NonZeroU32::new(3));
    }

    #[test]
    fn flag_updates_are_translated_and_silenceable() {
        let mut t = SessionTracker::new(vec![5, 9], 2);
        let silence: HashSet<u32> = [9].into_iter().collect();
        let changes = t.apply_poll(
            poll(2, 4, vec![upd(5, false, 3), upd(9, false, 4)]),
            &silence,
        );
        assert_eq!(
            changes,
            vec![TrackedChange::Flags(NonZeroU32::new(1).unwrap(), 5)]
        );
    }

    #[test]
    fn count_never_decreases_without_expunge() {
        let mut t = SessionTracker::new(vec![1, 2, 3], 2);
        let changes = t.apply_poll(poll(1, 9, vec![]), &HashSet::new());
        assert!(changes.is_empty());
        assert_eq!(t.len(), 3);
    }

    #[test]
    fn uids_stay_strictly_increasing() {
        let mut t = SessionTracker::new(vec![2, 4], 1);
        t.apply_poll(poll(3, 3, vec![upd(9, false, 2)]), &HashSet::new());
        t.apply_poll(poll(4, 5, vec![upd(6, false, 4)]), &HashSet::new());
        let seqs: Vec<_> = (1..=t.len())
            .map(|i| t.uid_of_seq(NonZeroU32::new(i).unwrap()).unwrap())
            .collect();
        assert_eq!(seqs, vec![2, 4, 6, 9]);
    }

    #[test]
    fn decode_uid_mode() {
        let t = SessionTracker::new(vec![3, 7, 12, 40], 1);
        let set: SequenceSet = "5:13".try_into().unwrap();
        assert_eq!(t.decode_sequence_set(&set, true), vec![7, 12]);

        let star: SequenceSet = "12:*".try_into().unwrap();
        assert_eq!(t.decode_sequence_set(&star, true), vec![12, 40]);
    }

    #[test]
    fn decode_seq_mode() {
        let t = SessionTracker::new(vec![3, 7, 12, 40], 1);
        let set: SequenceSet = "2,4".try_into().unwrap();
        assert_eq!(t.decode_sequence_set(&set, false), vec![7, 40]);

        let all: SequenceSet = "1:*".try_into().unwrap();
        assert_eq!(t.decode_sequence_set(&all, false), vec![3, 7, 12, 40]);
    }

    #[test]
    fn decode_on_empty_mailbox() {
        // A just-selected empty mailbox: `*` resolves to 0 in both modes
        // and must select nothing rather than underflow a rank.
        let t = SessionTracker::new(vec![], 1);
        for spec in ["*", "1:*", "1", "1:5"] {
            let set: SequenceSet = spec.try_into().unwrap();
            assert_eq!(t.decode_sequence_set(&set, false), Vec::<u32>::new());
            assert_eq!(t.decode_sequence_set(&set, true), Vec::<u32>::new());
        }
    }
}
