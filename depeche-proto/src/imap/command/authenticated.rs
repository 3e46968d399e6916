use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use imap_codec::imap_types::command::{Command, CommandBody};
use imap_codec::imap_types::core::{Literal, QuotedChar};
use imap_codec::imap_types::datetime::DateTime;
use imap_codec::imap_types::flag::Flag;
use imap_codec::imap_types::mailbox::{ListMailbox, Mailbox as MailboxCodec};
use imap_codec::imap_types::response::{Code, CodeOther, Data};
use imap_codec::imap_types::status::{StatusDataItem, StatusDataItemName};
use tokio::sync::watch;

use depeche_meta::model::MailboxRow;
use depeche_user::error::Error;

use crate::imap::capability::ServerCapability;
use crate::imap::command::{anystate, error_code, list_pattern_matches, MailboxName};
use crate::imap::flags;
use crate::imap::flow;
use crate::imap::mailbox_view::MailboxView;
use crate::imap::response::{Body, Response};
use crate::{Account, Backend};

pub struct AuthenticatedContext<'a> {
    pub req: &'a Command<'static>,
    pub backend: &'a Arc<Backend>,
    pub account: &'a Account,
    pub server_capabilities: &'a ServerCapability,
    pub must_exit: &'a watch::Receiver<bool>,
}

pub async fn dispatch<'a>(
    ctx: AuthenticatedContext<'a>,
) -> Result<(Response<'static>, flow::Transition)> {
    match &ctx.req.body {
        // Any state
        CommandBody::Capability => {
            anystate::capability(ctx.req.tag.clone(), ctx.server_capabilities)
        }
        CommandBody::Logout => anystate::logout(),

        // Specific to this state (11 commands)
        CommandBody::Noop | CommandBody::Check => anystate::noop_nothing(ctx.req.tag.clone()),
        CommandBody::Create { mailbox } => ctx.create(mailbox).await,
        CommandBody::Delete { mailbox } => ctx.delete(mailbox).await,
        CommandBody::Rename { from, to } => ctx.rename(from, to).await,
        CommandBody::Lsub {
            reference,
            mailbox_wildcard,
        } => ctx.list(reference, mailbox_wildcard, true).await,
        CommandBody::List {
            reference,
            mailbox_wildcard,
        } => ctx.list(reference, mailbox_wildcard, false).await,
        CommandBody::Status {
            mailbox,
            item_names,
        } => ctx.status(mailbox, item_names).await,
        CommandBody::Subscribe { mailbox } => ctx.set_subscribed(mailbox, true).await,
        CommandBody::Unsubscribe { mailbox } => ctx.set_subscribed(mailbox, false).await,
        CommandBody::Select {
            mailbox,
            modifiers: _,
        } => ctx.select(mailbox, flow::MailboxPerm::ReadWrite).await,
        CommandBody::Examine {
            mailbox,
            modifiers: _,
        } => ctx.select(mailbox, flow::MailboxPerm::ReadOnly).await,
        CommandBody::Append {
            mailbox,
            flags,
            date,
            message,
        } => ctx.append(mailbox, flags, date, message).await,

        // In this state, we only command the uncommandable
        _ => anystate::wrong_state(ctx.req.tag.clone()),
    }
}

impl<'a> AuthenticatedContext<'a> {
    fn failed(&self, e: Error) -> Result<(Response<'static>, flow::Transition)> {
        let mut resp = Response::build().to_req(self.req).message(e.to_string());
        if let Some(code) = error_code(&e) {
            resp = resp.code(code);
        }
        Ok((resp.no()?, flow::Transition::None))
    }

    async fn create(
        self,
        mailbox: &MailboxCodec<'a>,
    ) -> Result<(Response<'static>, flow::Transition)> {
        let name: &str = MailboxName(mailbox).try_into()?;
        match self.backend.meta.create_mailbox(self.account.id, name).await {
            Ok(_) => Ok((
                Response::build()
                    .to_req(self.req)
                    .message("CREATE complete")
                    .ok()?,
                flow::Transition::None,
            )),
            Err(e) => self.failed(e),
        }
    }

    async fn delete(
        self,
        mailbox: &MailboxCodec<'a>,
    ) -> Result<(Response<'static>, flow::Transition)> {
        let name: &str = MailboxName(mailbox).try_into()?;
        match self.backend.meta.delete_mailbox(self.account.id, name).await {
            Ok(()) => Ok((
                Response::build()
                    .to_req(self.req)
                    .message("DELETE complete")
                    .ok()?,
                flow::Transition::None,
            )),
            Err(e) => self.failed(e),
        }
    }

    async fn rename(
        self,
        from: &MailboxCodec<'a>,
        to: &MailboxCodec<'a>,
    ) -> Result<(Response<'static>, flow::Transition)> {
        let from: &str = MailboxName(from).try_into()?;
        let to: &str = MailboxName(to).try_into()?;
        match self
            .backend
            .meta
            .rename_mailbox(self.account.id, from, to)
            .await
        {
            Ok(()) => Ok((
                Response::build()
                    .to_req(self.req)
                    .message("RENAME complete")
                    .ok()?,
                flow::Transition::None,
            )),
            Err(e) => self.failed(e),
        }
    }

    async fn list(
        self,
        reference: &MailboxCodec<'a>,
        pattern: &ListMailbox<'a>,
        subscribed_only: bool,
    ) -> Result<(Response<'static>, flow::Transition)> {
        let reference: &str = MailboxName(reference).try_into()?;
        let pattern = list_mailbox_text(pattern);

        // An empty pattern asks for the hierarchy delimiter and root.
        if pattern.is_empty() {
            return Ok((
                Response::build()
                    .to_req(self.req)
                    .data(Data::List {
                        items: vec![],
                        delimiter: Some(QuotedChar::unvalidated('/')),
                        mailbox: MailboxCodec::try_from("")?,
                    })
                    .message("LIST completed")
                    .ok()?,
                flow::Transition::None,
            ));
        }

        let full_pattern = match reference.is_empty() {
            true => pattern.clone(),
            false => format!("{}/{}", reference.trim_end_matches('/'), pattern),
        };

        let mailboxes = self.backend.meta.list_mailboxes(self.account.id).await?;
        let mut data = Vec::new();
        for mb in mailboxes {
            if subscribed_only && !mb.subscribed {
                continue;
            }
            if !list_pattern_matches(&full_pattern, &mb.name) {
                continue;
            }
            data.push(Body::Data(Data::List {
                items: vec![],
                delimiter: Some(QuotedChar::unvalidated('/')),
                mailbox: MailboxCodec::try_from(mb.name.as_str())?,
            }));
        }

        let verb = if subscribed_only { "LSUB" } else { "LIST" };
        Ok((
            Response::build()
                .to_req(self.req)
                .set_body(data)
                .message(format!("{} completed", verb))
                .ok()?,
            flow::Transition::None,
        ))
    }

    async fn status(
        self,
        mailbox: &MailboxCodec<'static>,
        item_names: &[StatusDataItemName],
    ) -> Result<(Response<'static>, flow::Transition)> {
        let name: &str = MailboxName(mailbox).try_into()?;
        let row = match self.backend.meta.get_mailbox_by_name(self.account.id, name).await {
            Ok(row) => row,
            Err(e) => return self.failed(e),
        };
        let summary = self.backend.meta.get_summary(row.mailbox_id).await?;

        let items = item_names
            .iter()
            .filter_map(|attr| match attr {
                StatusDataItemName::Messages => Some(StatusDataItem::Messages(summary.num_messages)),
                StatusDataItemName::Recent => Some(StatusDataItem::Recent(summary.recent)),
                StatusDataItemName::Unseen => Some(StatusDataItem::Unseen(summary.unseen)),
                StatusDataItemName::UidNext => summary
                    .uid_next
                    .try_into()
                    .ok()
                    .map(StatusDataItem::UidNext),
                StatusDataItemName::UidValidity => row
                    .uid_validity
                    .try_into()
                    .ok()
                    .map(StatusDataItem::UidValidity),
                _ => None,
            })
            .collect::<Vec<_>>();

        Ok((
            Response::build()
                .to_req(self.req)
                .data(Data::Status {
                    mailbox: mailbox.clone(),
                    items: items.into(),
                })
                .message("STATUS completed")
                .ok()?,
            flow::Transition::None,
        ))
    }

    async fn set_subscribed(
        self,
        mailbox: &MailboxCodec<'a>,
        subscribed: bool,
    ) -> Result<(Response<'static>, flow::Transition)> {
        let name: &str = MailboxName(mailbox).try_into()?;
        match self
            .backend
            .meta
            .set_subscribed(self.account.id, name, subscribed)
            .await
        {
            Ok(()) => Ok((
                Response::build()
                    .to_req(self.req)
                    .message("Completed")
                    .ok()?,
                flow::Transition::None,
            )),
            Err(e) => self.failed(e),
        }
    }

    async fn select(
        self,
        mailbox: &MailboxCodec<'a>,
        perm: flow::MailboxPerm,
    ) -> Result<(Response<'static>, flow::Transition)> {
        let name: &str = MailboxName(mailbox).try_into()?;

        let row: MailboxRow = match self
            .backend
            .meta
            .get_mailbox_by_name(self.account.id, name)
            .await
        {
            Ok(row) => row,
            Err(e) => return self.failed(e),
        };
        tracing::info!(username = %self.account.address, mailbox = %name, "mailbox.selected");

        let (view, data) = MailboxView::open(
            self.backend.meta.clone(),
            self.backend.bodies.clone(),
            self.account.id,
            row,
            matches!(perm, flow::MailboxPerm::ReadWrite),
        )
        .await?;

        let (code, verb) = match perm {
            flow::MailboxPerm::ReadWrite => (Code::ReadWrite, "SELECT"),
            flow::MailboxPerm::ReadOnly => (Code::ReadOnly, "EXAMINE"),
        };
        Ok((
            Response::build()
                .to_req(self.req)
                .set_body(data)
                .code(code)
                .message(format!("{} completed", verb))
                .ok()?,
            flow::Transition::Select(view, perm),
        ))
    }

    async fn append(
        self,
        mailbox: &MailboxCodec<'a>,
        flags: &[Flag<'a>],
        date: &Option<DateTime>,
        message: &Literal<'a>,
    ) -> Result<(Response<'static>, flow::Transition)> {
        let name: &str = MailboxName(mailbox).try_into()?;

        let row = match self
            .backend
            .meta
            .get_mailbox_by_name(self.account.id, name)
            .await
        {
            Ok(row) => row,
            Err(e) if e.is_not_found() => {
                return Ok((
                    Response::build()
                        .to_req(self.req)
                        .message("Destination mailbox does not exist")
                        .code(Code::TryCreate)
                        .no()?,
                    flow::Transition::None,
                ))
            }
            Err(e) => return self.failed(e),
        };

        let flag_set = flags::to_flag_set(flags.iter());
        let internal_date = date
            .as_ref()
            .map(|d| d.as_ref().with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        match self
            .backend
            .ingest
            .deliver(
                &self.account.address,
                row.mailbox_id,
                flag_set,
                internal_date,
                message.as_ref(),
                self.must_exit,
            )
            .await
        {
            Ok((uid, _modseq)) => Ok((
                Response::build()
                    .to_req(self.req)
                    .code(Code::Other(CodeOther::unvalidated(
                        format!("APPENDUID {} {}", row.uid_validity, uid).into_bytes(),
                    )))
                    .message("APPEND completed")
                    .ok()?,
                flow::Transition::None,
            )),
            Err(e) => self.failed(e),
        }
    }
}

fn list_mailbox_text(pattern: &ListMailbox) -> String {
    match pattern {
        ListMailbox::Token(t) => String::from_utf8_lossy(t.as_ref()).to_string(),
        ListMailbox::String(s) => String::from_utf8_lossy(s.as_ref()).to_string(),
    }
}
