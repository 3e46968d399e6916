use anyhow::{bail, Result};

use imap_codec::imap_types::core::Atom;
use imap_codec::imap_types::search::SearchKey;
use imap_codec::imap_types::sequence::SequenceSet;

use depeche_meta::model::flag_bits;
use depeche_meta::search::Criterion;

use crate::imap::command::astring_text;
use crate::imap::tracker::SessionTracker;

/// Translate a SEARCH key tree into catalog criteria. Sequence-number and
/// UID keys are resolved through the session tracker here, so the catalog
/// only ever sees UIDs.
pub fn criterion(key: &SearchKey, tracker: &SessionTracker) -> Result<Criterion> {
    Ok(match key {
        SearchKey::All => Criterion::All,

        SearchKey::Answered => Criterion::FlagSet(flag_bits::ANSWERED),
        SearchKey::Unanswered => Criterion::FlagClear(flag_bits::ANSWERED),
        SearchKey::Deleted => Criterion::FlagSet(flag_bits::DELETED),
        SearchKey::Undeleted => Criterion::FlagClear(flag_bits::DELETED),
        SearchKey::Draft => Criterion::FlagSet(flag_bits::DRAFT),
        SearchKey::Undraft => Criterion::FlagClear(flag_bits::DRAFT),
        SearchKey::Flagged => Criterion::FlagSet(flag_bits::FLAGGED),
        SearchKey::Unflagged => Criterion::FlagClear(flag_bits::FLAGGED),
        SearchKey::Seen => Criterion::FlagSet(flag_bits::SEEN),
        SearchKey::Unseen => Criterion::FlagClear(flag_bits::SEEN),
        SearchKey::Recent => Criterion::FlagSet(flag_bits::RECENT),
        SearchKey::Old => Criterion::FlagClear(flag_bits::RECENT),
        SearchKey::New => Criterion::And(vec![
            Criterion::FlagSet(flag_bits::RECENT),
            Criterion::FlagClear(flag_bits::SEEN),
        ]),

        SearchKey::Keyword(kw) => Criterion::Keyword(atom_text(kw)),
        SearchKey::Unkeyword(kw) => Criterion::Not(Box::new(Criterion::Keyword(atom_text(kw)))),

        SearchKey::Subject(s) => Criterion::Subject(astring_text(s)),
        SearchKey::From(s) => Criterion::From(astring_text(s)),
        SearchKey::To(s) => Criterion::To(astring_text(s)),
        SearchKey::Cc(s) => Criterion::Cc(astring_text(s)),
        SearchKey::Bcc(s) => Criterion::Bcc(astring_text(s)),
        SearchKey::Body(s) => Criterion::Body(astring_text(s)),
        SearchKey::Text(s) => Criterion::Text(astring_text(s)),

        SearchKey::Before(d) => Criterion::Before(*d.as_ref()),
        SearchKey::On(d) => Criterion::On(*d.as_ref()),
        SearchKey::Since(d) => Criterion::Since(*d.as_ref()),
        SearchKey::SentBefore(d) => Criterion::SentBefore(*d.as_ref()),
        SearchKey::SentOn(d) => Criterion::SentOn(*d.as_ref()),
        SearchKey::SentSince(d) => Criterion::SentSince(*d.as_ref()),

        SearchKey::Larger(n) => Criterion::Larger(*n as u64),
        SearchKey::Smaller(n) => Criterion::Smaller(*n as u64),

        SearchKey::Uid(set) => uid_criterion(set, tracker, true),
        SearchKey::SequenceSet(set) => uid_criterion(set, tracker, false),

        SearchKey::And(list) => Criterion::And(
            list.as_ref()
                .iter()
                .map(|k| criterion(k, tracker))
                .collect::<Result<Vec<_>>>()?,
        ),
        SearchKey::Or(a, b) => Criterion::Or(
            Box::new(criterion(a, tracker)?),
            Box::new(criterion(b, tracker)?),
        ),
        SearchKey::Not(inner) => Criterion::Not(Box::new(criterion(inner, tracker)?)),

        other => bail!("SEARCH key {:?} is not supported", other),
    })
}

fn uid_criterion(set: &SequenceSet, tracker: &SessionTracker, by_uid: bool) -> Criterion {
    let uids = tracker.decode_sequence_set(set, by_uid);
    Criterion::UidIn(uids.into_iter().map(|u| (u, u)).collect())
}

fn atom_text(a: &Atom) -> String {
    a.inner().to_string()
}
