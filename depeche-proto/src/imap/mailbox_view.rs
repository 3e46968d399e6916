use std::collections::{HashMap, HashSet};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Error, Result};

use imap_codec::imap_types::core::NonEmptyVec;
use imap_codec::imap_types::fetch::MessageDataItem;
use imap_codec::imap_types::flag::{Flag, FlagFetch, FlagPerm, StoreResponse, StoreType};
use imap_codec::imap_types::response::{Code, Data, Status};
use imap_codec::imap_types::search::SearchKey;
use imap_codec::imap_types::sequence::SequenceSet;

use eml_codec::part::AnyPart;

use depeche_mail::bodies::Bodies;
use depeche_meta::model::{
    flag_bits, AccountId, FlagSet, MailboxRow, MailboxSummary, TRASH,
};
use depeche_meta::{FlagOp, FlagRewrite, MetaStore};

use crate::imap::attributes::AttributesProxy;
use crate::imap::flags;
use crate::imap::mail_view::{MailView, SeenFlag};
use crate::imap::response::Body;
use crate::imap::search;
use crate::imap::tracker::{SessionTracker, TrackedChange};

const DEFAULT_FLAGS: [Flag; 5] = [
    Flag::Seen,
    Flag::Answered,
    Flag::Flagged,
    Flag::Deleted,
    Flag::Draft,
];

/// How long IDLE sleeps between polls.
const IDLE_POLL_INTERVAL: Duration = Duration::from_secs(15);

/// A selected mailbox, from one session's point of view.
///
/// Owns the session tracker that translates between the client's sequence
/// numbers and UIDs, and drives the poll protocol: every command that may
/// emit unsolicited responses funnels through `poll`, which keeps the
/// tracker and the emitted responses in lockstep.
pub struct MailboxView {
    pub mailbox: MailboxRow,
    pub tracker: SessionTracker,
    account_id: AccountId,
    meta: Arc<MetaStore>,
    bodies: Arc<Bodies>,
}

impl MailboxView {
    /// Open a mailbox for SELECT/EXAMINE and produce the summary responses.
    pub async fn open(
        meta: Arc<MetaStore>,
        bodies: Arc<Bodies>,
        account_id: AccountId,
        mailbox: MailboxRow,
        read_write: bool,
    ) -> Result<(Self, Vec<Body<'static>>)> {
        let summary = meta.get_summary(mailbox.mailbox_id).await?;
        let index = meta.list_message_index(mailbox.mailbox_id).await?;
        if read_write {
            meta.clear_recent(mailbox.mailbox_id).await?;
        }

        let tracker = SessionTracker::new(
            index.iter().map(|(uid, _)| *uid).collect(),
            summary.highest_modseq,
        );
        let view = Self {
            mailbox,
            tracker,
            account_id,
            meta,
            bodies,
        };
        let data = view.summary_responses(&summary, &index)?;
        Ok((view, data))
    }

    fn summary_responses(
        &self,
        summary: &MailboxSummary,
        index: &[(u32, FlagSet)],
    ) -> Result<Vec<Body<'static>>> {
        let mut data: Vec<Body> = vec![
            Body::Data(Data::Exists(summary.num_messages)),
            Body::Data(Data::Recent(summary.recent)),
        ];

        // FLAGS: defaults plus whatever keywords are in use here.
        let mut known: Vec<Flag> = DEFAULT_FLAGS.to_vec();
        for (_, fs) in index {
            for f in &fs.custom {
                if let Some(FlagFetch::Flag(fl)) = flags::from_str(f) {
                    if !known.contains(&fl) {
                        known.push(fl);
                    }
                }
            }
        }
        data.push(Body::Data(Data::Flags(known)));

        let mut permanent = DEFAULT_FLAGS
            .iter()
            .map(|f| FlagPerm::Flag(f.clone()))
            .collect::<Vec<_>>();
        permanent.push(FlagPerm::Asterisk);
        data.push(Body::Status(
            Status::ok(
                None,
                Some(Code::PermanentFlags(permanent)),
                "Flags permitted",
            )
            .map_err(Error::msg)?,
        ));

        data.push(Body::Status(
            Status::ok(
                None,
                Some(Code::UidValidity(
                    NonZeroU32::try_from(self.mailbox.uid_validity)
                        .map_err(|_| anyhow!("uidvalidity is zero"))?,
                )),
                "UIDs valid",
            )
            .map_err(Error::msg)?,
        ));
        data.push(Body::Status(
            Status::ok(
                None,
                Some(Code::UidNext(
                    NonZeroU32::try_from(summary.uid_next)
                        .map_err(|_| anyhow!("uidnext is zero"))?,
                )),
                "Predicted next UID",
            )
            .map_err(Error::msg)?,
        ));
        if let Some(first) = summary.first_unseen.and_then(NonZeroU32::new) {
            data.push(Body::Status(
                Status::ok(None, Some(Code::Unseen(first)), "First unseen")
                    .map_err(Error::msg)?,
            ));
        }
        Ok(data)
    }

    /// Ask the catalog for everything newer than the session's modseq and
    /// turn it into unsolicited responses: EXPUNGE and FETCH FLAGS in
    /// modseq order, a trailing EXISTS when the count grew.
    pub async fn poll(
        &mut self,
        silence: &HashSet<u32>,
        with_uid: bool,
    ) -> Result<Vec<Body<'static>>> {
        let poll = self
            .meta
            .poll(self.mailbox.mailbox_id, self.tracker.highest_modseq())
            .await?;

        let flags_by_uid: HashMap<u32, FlagSet> = poll
            .updates
            .iter()
            .filter(|u| !u.is_expunge)
            .map(|u| (u.uid, u.flags.clone()))
            .collect();

        let mut data = Vec::new();
        for change in self.tracker.apply_poll(poll, silence) {
            match change {
                TrackedChange::Expunge(seq) => data.push(Body::Data(Data::Expunge(seq))),
                TrackedChange::Flags(seq, uid) => {
                    let fs = flags_by_uid.get(&uid).cloned().unwrap_or_default();
                    let mut items = vec![MessageDataItem::Flags(flags::fetch_flags(&fs))];
                    if with_uid {
                        items.push(MessageDataItem::Uid(
                            NonZeroU32::try_from(uid).map_err(Error::msg)?,
                        ));
                    }
                    data.push(Body::Data(Data::Fetch {
                        seq,
                        items: NonEmptyVec::try_from(items)?,
                    }));
                }
                TrackedChange::Exists(n) => data.push(Body::Data(Data::Exists(n))),
            }
        }
        Ok(data)
    }

    /// IDLE tail: wake up every poll interval, return as soon as there is
    /// something to tell the client. Cancellation comes from the session
    /// dropping this future.
    pub async fn idle_sync(&mut self) -> Result<Vec<Body<'static>>> {
        loop {
            tokio::time::sleep(IDLE_POLL_INTERVAL).await;
            let updates = self.poll(&HashSet::new(), false).await?;
            if !updates.is_empty() {
                return Ok(updates);
            }
        }
    }

    pub async fn fetch(
        &mut self,
        sequence_set: &SequenceSet,
        ap: &AttributesProxy,
        is_uid_fetch: &bool,
    ) -> Result<Vec<Body<'static>>> {
        let mailbox_id = self.mailbox.mailbox_id;
        let uids = self.tracker.decode_sequence_set(sequence_set, *is_uid_fetch);
        let rows = self.meta.get_messages_by_uids(mailbox_id, &uids).await?;

        let mut out = Vec::with_capacity(rows.len());
        let mut mark_seen = Vec::new();
        for row in &rows {
            let seq = match self.tracker.seq_of_uid(row.uid) {
                Some(seq) => seq,
                None => continue,
            };

            let envelope = match ap.need_envelope() {
                true => Some(self.meta.get_envelope(mailbox_id, row.uid).await?),
                false => None,
            };
            let structure = match ap.need_structure() {
                true => Some(self.meta.get_body_structure(mailbox_id, row.uid).await?),
                false => None,
            };
            let raw = match ap.need_raw() {
                true => {
                    let (blob, staging) = self.meta.get_body_ref(mailbox_id, row.uid).await?;
                    Some(self.bodies.fetch(&blob, staging.as_deref()).await?)
                }
                false => None,
            };
            let parsed = match raw.as_deref() {
                Some(bytes) => Some(AnyPart::Msg(
                    eml_codec::parse_message(bytes)
                        .map_err(|_| anyhow!("stored message no longer parses"))?
                        .1,
                )),
                None => None,
            };

            let view = MailView {
                seq,
                row,
                envelope: envelope.as_ref(),
                structure: structure.as_ref(),
                parsed: parsed.as_ref(),
            };
            let (body, seen) = view.filter(ap)?;
            if matches!(seen, SeenFlag::MustAdd) {
                mark_seen.push(row.uid);
            }
            out.push(body);
        }

        if !mark_seen.is_empty() {
            self.meta
                .update_flags(
                    mailbox_id,
                    &mark_seen,
                    FlagOp::Add,
                    &FlagSet::new(flag_bits::SEEN),
                )
                .await?;
            let silence = mark_seen.iter().copied().collect();
            out.extend(self.poll(&silence, *is_uid_fetch).await?);
        }
        Ok(out)
    }

    pub async fn store<'a>(
        &mut self,
        sequence_set: &SequenceSet,
        kind: &StoreType,
        response: &StoreResponse,
        flags: &[Flag<'a>],
        is_uid_store: &bool,
    ) -> Result<Vec<Body<'static>>> {
        let uids = self.tracker.decode_sequence_set(sequence_set, *is_uid_store);
        let op = match kind {
            StoreType::Add => FlagOp::Add,
            StoreType::Remove => FlagOp::Remove,
            StoreType::Replace => FlagOp::Set,
        };
        let flag_set = flags::to_flag_set(flags.iter());

        let updated = self
            .meta
            .update_flags(self.mailbox.mailbox_id, &uids, op, &flag_set)
            .await?;

        let mut out = Vec::new();
        if matches!(response, StoreResponse::Answer) {
            for (uid, new_flags, _) in &updated {
                if let Some(seq) = self.tracker.seq_of_uid(*uid) {
                    let mut items = vec![MessageDataItem::Flags(flags::fetch_flags(new_flags))];
                    if *is_uid_store {
                        items.push(MessageDataItem::Uid(
                            NonZeroU32::try_from(*uid).map_err(Error::msg)?,
                        ));
                    }
                    out.push(Body::Data(Data::Fetch {
                        seq,
                        items: NonEmptyVec::try_from(items)?,
                    }));
                }
            }
        }

        let silence: HashSet<u32> = updated.iter().map(|(uid, _, _)| *uid).collect();
        out.extend(self.poll(&silence, *is_uid_store).await?);
        Ok(out)
    }

    /// EXPUNGE, with the Trash redirection: outside Trash, deleted messages
    /// move there instead (keeping `\Deleted`, gaining `\Seen`); inside
    /// Trash they are gone for real. Either way the client sees EXPUNGE
    /// responses through the poll that follows.
    pub async fn expunge(
        &mut self,
        uid_filter: Option<&SequenceSet>,
    ) -> Result<Vec<Body<'static>>> {
        let mailbox_id = self.mailbox.mailbox_id;
        let deleted = self
            .meta
            .get_messages_by_flag(mailbox_id, flag_bits::DELETED)
            .await?;
        let mut targets: Vec<u32> = deleted
            .into_iter()
            .filter(|uid| self.tracker.seq_of_uid(*uid).is_some())
            .collect();
        if let Some(filter) = uid_filter {
            let allowed: HashSet<u32> = self
                .tracker
                .decode_sequence_set(filter, true)
                .into_iter()
                .collect();
            targets.retain(|uid| allowed.contains(uid));
        }

        if !targets.is_empty() {
            if self.is_trash() {
                self.meta.expunge(mailbox_id, &targets).await?;
            } else {
                let trash = self.meta.get_mailbox_by_name(self.account_id, TRASH).await?;
                self.meta
                    .move_messages(mailbox_id, &targets, trash.mailbox_id, FlagRewrite::trash())
                    .await?;
            }
        }
        self.poll(&HashSet::new(), false).await
    }

    pub async fn copy(
        &self,
        sequence_set: &SequenceSet,
        to: &MailboxRow,
        is_uid_copy: &bool,
    ) -> Result<(u32, Vec<(u32, u32)>)> {
        let uids = self.tracker.decode_sequence_set(sequence_set, *is_uid_copy);
        self.meta
            .copy_messages(
                self.mailbox.mailbox_id,
                &uids,
                to.mailbox_id,
                FlagRewrite::default(),
            )
            .await
            .map_err(Error::msg)
    }

    pub async fn r#move(
        &mut self,
        sequence_set: &SequenceSet,
        to: &MailboxRow,
        is_uid_move: &bool,
    ) -> Result<(u32, Vec<(u32, u32)>, Vec<Body<'static>>)> {
        let uids = self.tracker.decode_sequence_set(sequence_set, *is_uid_move);
        let rewrite = if to.name.eq_ignore_ascii_case(TRASH) {
            FlagRewrite::trash()
        } else {
            FlagRewrite::default()
        };
        let (validity, mapping) = self
            .meta
            .move_messages(self.mailbox.mailbox_id, &uids, to.mailbox_id, rewrite)
            .await?;
        let data = self.poll(&HashSet::new(), *is_uid_move).await?;
        Ok((validity, mapping, data))
    }

    pub async fn search<'a>(
        &mut self,
        search_key: &SearchKey<'a>,
        is_uid_search: bool,
    ) -> Result<Vec<Body<'static>>> {
        let crit = search::criterion(search_key, &self.tracker)?;
        let found = self.meta.search(self.mailbox.mailbox_id, &crit).await?;

        let ids: Vec<NonZeroU32> = found
            .iter()
            .filter_map(|(uid, _)| match is_uid_search {
                true => NonZeroU32::new(*uid),
                false => self.tracker.seq_of_uid(*uid),
            })
            .collect();
        Ok(vec![Body::Data(Data::Search(ids, None))])
    }

    fn is_trash(&self) -> bool {
        self.mailbox.name.eq_ignore_ascii_case(TRASH)
    }
}
