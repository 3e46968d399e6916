use std::num::NonZeroU32;

use anyhow::{anyhow, Result};
use chrono::Offset;

use imap_codec::imap_types::core::NString;
use imap_codec::imap_types::datetime::DateTime;
use imap_codec::imap_types::fetch::{MessageDataItem, MessageDataItemName, Section as FetchSection};
use imap_codec::imap_types::response::Data;

use eml_codec::part::AnyPart;

use depeche_meta::model::{self, flag_bits, MessageRow};

use crate::imap::attributes::AttributesProxy;
use crate::imap::flags;
use crate::imap::mime_view;
use crate::imap::response::Body;

/// One message, assembled for FETCH: catalog row plus whatever optional
/// pieces the requested attributes made us load.
pub struct MailView<'a> {
    pub seq: NonZeroU32,
    pub row: &'a MessageRow,
    pub envelope: Option<&'a model::Envelope>,
    pub structure: Option<&'a model::BodyStructure>,
    pub parsed: Option<&'a AnyPart<'a>>,
}

pub enum SeenFlag {
    DoNothing,
    MustAdd,
}

impl<'a> MailView<'a> {
    pub fn filter(&self, ap: &AttributesProxy) -> Result<(Body<'static>, SeenFlag)> {
        let mut seen = SeenFlag::DoNothing;
        let res_attrs = ap
            .attrs
            .iter()
            .map(|attr| match attr {
                MessageDataItemName::Uid => Ok(self.uid()?),
                MessageDataItemName::Flags => Ok(self.flags()),
                MessageDataItemName::Rfc822Size => Ok(self.rfc_822_size()),
                MessageDataItemName::InternalDate => Ok(self.internal_date()),
                MessageDataItemName::Envelope => self.envelope(),
                MessageDataItemName::Body => self.body(),
                MessageDataItemName::BodyStructure => self.body_structure(),
                MessageDataItemName::Rfc822 => self.rfc822(),
                MessageDataItemName::Rfc822Header => self.rfc_822_header(),
                MessageDataItemName::Rfc822Text => self.rfc_822_text(),
                MessageDataItemName::BodyExt {
                    section,
                    partial,
                    peek,
                } => {
                    let (body, has_seen) = self.body_ext(section, partial, peek)?;
                    if matches!(has_seen, SeenFlag::MustAdd) {
                        seen = SeenFlag::MustAdd;
                    }
                    Ok(body)
                }
                MessageDataItemName::ModSeq => {
                    Err(anyhow!("modseq data items are not advertised"))
                }
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok((
            Body::Data(Data::Fetch {
                seq: self.seq,
                items: res_attrs.try_into()?,
            }),
            seen,
        ))
    }

    fn uid(&self) -> Result<MessageDataItem<'static>> {
        Ok(MessageDataItem::Uid(NonZeroU32::try_from(self.row.uid)?))
    }

    fn flags(&self) -> MessageDataItem<'static> {
        MessageDataItem::Flags(flags::fetch_flags(&self.row.flags))
    }

    fn rfc_822_size(&self) -> MessageDataItem<'static> {
        MessageDataItem::Rfc822Size(self.row.size as u32)
    }

    fn internal_date(&self) -> MessageDataItem<'static> {
        MessageDataItem::InternalDate(DateTime::unvalidated(
            self.row
                .internal_date
                .with_timezone(&self.row.internal_date.offset().fix()),
        ))
    }

    fn envelope(&self) -> Result<MessageDataItem<'static>> {
        let env = self.envelope.ok_or(anyhow!("envelope was not loaded"))?;
        Ok(MessageDataItem::Envelope(mime_view::imap_envelope(env)))
    }

    fn body(&self) -> Result<MessageDataItem<'static>> {
        let bs = self.structure.ok_or(anyhow!("structure was not loaded"))?;
        Ok(MessageDataItem::Body(mime_view::imap_structure(bs, false)?))
    }

    fn body_structure(&self) -> Result<MessageDataItem<'static>> {
        let bs = self.structure.ok_or(anyhow!("structure was not loaded"))?;
        Ok(MessageDataItem::BodyStructure(mime_view::imap_structure(
            bs, true,
        )?))
    }

    fn parsed(&self) -> Result<&'a AnyPart<'a>> {
        self.parsed.ok_or(anyhow!("message body was not loaded"))
    }

    fn rfc822(&self) -> Result<MessageDataItem<'static>> {
        let msg = self
            .parsed()?
            .as_message()
            .ok_or(anyhow!("not a message"))?;
        let full: NString = msg.raw_part.to_vec().try_into()?;
        Ok(MessageDataItem::Rfc822(full))
    }

    fn rfc_822_header(&self) -> Result<MessageDataItem<'static>> {
        let msg = self
            .parsed()?
            .as_message()
            .ok_or(anyhow!("not a message"))?;
        let hdrs: NString = msg.raw_headers.to_vec().try_into()?;
        Ok(MessageDataItem::Rfc822Header(hdrs))
    }

    fn rfc_822_text(&self) -> Result<MessageDataItem<'static>> {
        let msg = self
            .parsed()?
            .as_message()
            .ok_or(anyhow!("not a message"))?;
        let txt: NString = msg.raw_body.to_vec().try_into()?;
        Ok(MessageDataItem::Rfc822Text(txt))
    }

    /// BODY[<section>]<<partial>> / BODY.PEEK[...]: peek leaves `\Seen`
    /// alone, a plain BODY fetch on an unseen message must set it.
    fn body_ext(
        &self,
        section: &Option<FetchSection<'static>>,
        partial: &Option<(u32, NonZeroU32)>,
        peek: &bool,
    ) -> Result<(MessageDataItem<'static>, SeenFlag)> {
        let mut seen = SeenFlag::DoNothing;
        if !peek && !self.row.flags.has(flag_bits::SEEN) {
            seen = SeenFlag::MustAdd;
        }

        let (text, origin) = match mime_view::body_ext(self.parsed()?, section, partial)? {
            mime_view::BodySection::Full(body) => (body, None),
            mime_view::BodySection::Slice { body, origin_octet } => (body, Some(origin_octet)),
        };
        let data: NString = text.to_vec().try_into()?;

        Ok((
            MessageDataItem::BodyExt {
                section: section.clone(),
                origin,
                data,
            },
            seen,
        ))
    }
}
