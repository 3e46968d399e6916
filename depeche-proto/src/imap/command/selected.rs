use std::sync::Arc;

use anyhow::Result;
use imap_codec::imap_types::command::{Command, CommandBody};
use imap_codec::imap_types::fetch::MacroOrMessageDataItemNames;
use imap_codec::imap_types::flag::{Flag, StoreResponse, StoreType};
use imap_codec::imap_types::mailbox::Mailbox as MailboxCodec;
use imap_codec::imap_types::response::{Code, CodeOther};
use imap_codec::imap_types::search::SearchKey;
use imap_codec::imap_types::sequence::SequenceSet;
use tokio::sync::watch;

use depeche_meta::model::MailboxRow;

use crate::imap::attributes::AttributesProxy;
use crate::imap::capability::ServerCapability;
use crate::imap::command::{anystate, authenticated, MailboxName};
use crate::imap::flow;
use crate::imap::mailbox_view::MailboxView;
use crate::imap::response::Response;
use crate::{Account, Backend};

pub struct SelectedContext<'a> {
    pub req: &'a Command<'static>,
    pub backend: &'a Arc<Backend>,
    pub account: &'a Account,
    pub mailbox: &'a mut MailboxView,
    pub server_capabilities: &'a ServerCapability,
    pub perm: &'a flow::MailboxPerm,
    pub must_exit: &'a watch::Receiver<bool>,
}

pub async fn dispatch<'a>(
    ctx: SelectedContext<'a>,
) -> Result<(Response<'static>, flow::Transition)> {
    match &ctx.req.body {
        // Any State
        CommandBody::Capability => {
            anystate::capability(ctx.req.tag.clone(), ctx.server_capabilities)
        }
        CommandBody::Logout => anystate::logout(),

        // Specific to this state (8 commands + NOOP)
        CommandBody::Close => match ctx.perm {
            flow::MailboxPerm::ReadWrite => ctx.close().await,
            flow::MailboxPerm::ReadOnly => ctx.examine_close().await,
        },
        CommandBody::Unselect => ctx.unselect().await,
        CommandBody::Noop | CommandBody::Check => ctx.noop().await,
        CommandBody::Fetch {
            sequence_set,
            macro_or_item_names,
            modifiers: _,
            uid,
        } => ctx.fetch(sequence_set, macro_or_item_names, uid).await,
        CommandBody::Search {
            charset: _,
            criteria,
            uid,
        } => ctx.search(&SearchKey::And(criteria.clone()), uid).await,
        CommandBody::Expunge {
            // UIDPLUS (rfc4315)
            uid_sequence_set,
        } => ctx.expunge(uid_sequence_set).await,
        CommandBody::Store {
            sequence_set,
            kind,
            response,
            flags,
            modifiers: _,
            uid,
        } => ctx.store(sequence_set, kind, response, flags, uid).await,
        CommandBody::Copy {
            sequence_set,
            mailbox,
            uid,
        } => ctx.copy(sequence_set, mailbox, uid).await,
        CommandBody::Move {
            sequence_set,
            mailbox,
            uid,
        } => ctx.r#move(sequence_set, mailbox, uid).await,

        // In selected mode, we fallback to authenticated when needed
        _ => {
            authenticated::dispatch(authenticated::AuthenticatedContext {
                req: ctx.req,
                backend: ctx.backend,
                account: ctx.account,
                server_capabilities: ctx.server_capabilities,
                must_exit: ctx.must_exit,
            })
            .await
        }
    }
}

// --- PRIVATE ---

impl<'a> SelectedContext<'a> {
    /// CLOSE expunges and falls back to authenticated state, without
    /// sending the untagged EXPUNGE responses.
    async fn close(self) -> Result<(Response<'static>, flow::Transition)> {
        let tag = self.req.tag.clone();
        self.mailbox.expunge(None).await?;
        Ok((
            Response::build().tag(tag).message("CLOSE completed").ok()?,
            flow::Transition::Unselect,
        ))
    }

    /// CLOSE in examined state does not expunge.
    async fn examine_close(self) -> Result<(Response<'static>, flow::Transition)> {
        Ok((
            Response::build()
                .to_req(self.req)
                .message("CLOSE completed")
                .ok()?,
            flow::Transition::Unselect,
        ))
    }

    async fn unselect(self) -> Result<(Response<'static>, flow::Transition)> {
        Ok((
            Response::build()
                .to_req(self.req)
                .message("UNSELECT completed")
                .ok()?,
            flow::Transition::Unselect,
        ))
    }

    async fn noop(self) -> Result<(Response<'static>, flow::Transition)> {
        let updates = self.mailbox.poll(&Default::default(), false).await?;
        Ok((
            Response::build()
                .to_req(self.req)
                .message("NOOP completed.")
                .set_body(updates)
                .ok()?,
            flow::Transition::None,
        ))
    }

    async fn fetch(
        self,
        sequence_set: &SequenceSet,
        attributes: &'a MacroOrMessageDataItemNames<'static>,
        uid: &bool,
    ) -> Result<(Response<'static>, flow::Transition)> {
        let ap = AttributesProxy::new(attributes, *uid);

        match self.mailbox.fetch(sequence_set, &ap, uid).await {
            Ok(resp) => Ok((
                Response::build()
                    .to_req(self.req)
                    .message("FETCH completed")
                    .set_body(resp)
                    .ok()?,
                flow::Transition::None,
            )),
            Err(e) => Ok((
                Response::build()
                    .to_req(self.req)
                    .message(e.to_string())
                    .no()?,
                flow::Transition::None,
            )),
        }
    }

    pub async fn search(
        self,
        key: &SearchKey<'a>,
        uid: &bool,
    ) -> Result<(Response<'static>, flow::Transition)> {
        match self.mailbox.search(key, *uid).await {
            Ok(found) => Ok((
                Response::build()
                    .to_req(self.req)
                    .set_body(found)
                    .message("SEARCH completed")
                    .ok()?,
                flow::Transition::None,
            )),
            Err(e) => Ok((
                Response::build()
                    .to_req(self.req)
                    .message(e.to_string())
                    .no()?,
                flow::Transition::None,
            )),
        }
    }

    async fn expunge(
        self,
        uid_sequence_set: &Option<SequenceSet>,
    ) -> Result<(Response<'static>, flow::Transition)> {
        if let Some(failed) = self.fail_read_only() {
            return Ok((failed, flow::Transition::None));
        }

        let tag = self.req.tag.clone();
        let data = self.mailbox.expunge(uid_sequence_set.as_ref()).await?;

        Ok((
            Response::build()
                .tag(tag)
                .message("EXPUNGE completed")
                .set_body(data)
                .ok()?,
            flow::Transition::None,
        ))
    }

    async fn store(
        self,
        sequence_set: &SequenceSet,
        kind: &StoreType,
        response: &StoreResponse,
        flags: &[Flag<'a>],
        uid: &bool,
    ) -> Result<(Response<'static>, flow::Transition)> {
        if let Some(failed) = self.fail_read_only() {
            return Ok((failed, flow::Transition::None));
        }

        let data = self
            .mailbox
            .store(sequence_set, kind, response, flags, uid)
            .await?;

        Ok((
            Response::build()
                .to_req(self.req)
                .message("STORE completed")
                .set_body(data)
                .ok()?,
            flow::Transition::None,
        ))
    }

    async fn copy(
        self,
        sequence_set: &SequenceSet,
        mailbox: &MailboxCodec<'a>,
        uid: &bool,
    ) -> Result<(Response<'static>, flow::Transition)> {
        if let Some(failed) = self.fail_read_only() {
            return Ok((failed, flow::Transition::None));
        }

        let dst = match self.destination(mailbox).await? {
            Ok(row) => row,
            Err(resp) => return Ok((resp, flow::Transition::None)),
        };

        let (uidval, uid_map) = self.mailbox.copy(sequence_set, &dst, uid).await?;

        Ok((
            Response::build()
                .to_req(self.req)
                .message("COPY completed")
                .code(Code::Other(CodeOther::unvalidated(
                    format!("COPYUID {}", copyuid_str(uidval, &uid_map)).into_bytes(),
                )))
                .ok()?,
            flow::Transition::None,
        ))
    }

    async fn r#move(
        self,
        sequence_set: &SequenceSet,
        mailbox: &MailboxCodec<'a>,
        uid: &bool,
    ) -> Result<(Response<'static>, flow::Transition)> {
        if let Some(failed) = self.fail_read_only() {
            return Ok((failed, flow::Transition::None));
        }

        let dst = match self.destination(mailbox).await? {
            Ok(row) => row,
            Err(resp) => return Ok((resp, flow::Transition::None)),
        };

        let (uidval, uid_map, data) = self.mailbox.r#move(sequence_set, &dst, uid).await?;

        Ok((
            Response::build()
                .to_req(self.req)
                .message("MOVE completed")
                .code(Code::Other(CodeOther::unvalidated(
                    format!("COPYUID {}", copyuid_str(uidval, &uid_map)).into_bytes(),
                )))
                .set_body(data)
                .ok()?,
            flow::Transition::None,
        ))
    }

    async fn destination(
        &self,
        mailbox: &MailboxCodec<'a>,
    ) -> Result<std::result::Result<MailboxRow, Response<'static>>> {
        let name: &str = MailboxName(mailbox).try_into()?;
        match self
            .backend
            .meta
            .get_mailbox_by_name(self.account.id, name)
            .await
        {
            Ok(row) => Ok(Ok(row)),
            Err(e) if e.is_not_found() => Ok(Err(Response::build()
                .to_req(self.req)
                .message("Destination mailbox does not exist")
                .code(Code::TryCreate)
                .no()?)),
            Err(e) => Err(e.into()),
        }
    }

    fn fail_read_only(&self) -> Option<Response<'static>> {
        match self.perm {
            flow::MailboxPerm::ReadWrite => None,
            flow::MailboxPerm::ReadOnly => Some(
                Response::build()
                    .to_req(self.req)
                    .message("Write commands are forbidden while examining a mailbox")
                    .no()
                    .unwrap(),
            ),
        }
    }
}

fn copyuid_str(uidval: u32, uid_map: &[(u32, u32)]) -> String {
    format!(
        "{} {} {}",
        uidval,
        uid_map
            .iter()
            .map(|(sid, _)| sid.to_string())
            .collect::<Vec<_>>()
            .join(","),
        uid_map
            .iter()
            .map(|(_, tuid)| tuid.to_string())
            .collect::<Vec<_>>()
            .join(",")
    )
}
