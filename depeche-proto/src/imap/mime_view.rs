use std::borrow::Cow;
use std::collections::HashSet;
use std::num::NonZeroU32;

use anyhow::{anyhow, bail, Result};

use imap_codec::imap_types::body::{
    BasicFields, Body as FetchBody, BodyStructure, MultiPartExtensionData, SinglePartExtensionData,
    SpecificFields,
};
use imap_codec::imap_types::core::{AString, IString, NString, NonEmptyVec};
use imap_codec::imap_types::envelope::{Address, Envelope};
use imap_codec::imap_types::fetch::{Part as FetchPart, Section as FetchSection};

use eml_codec::{header, part::AnyPart};

use depeche_meta::model;

// ---- catalog → wire conversions ----

/// Stored envelope → RFC 3501 ENVELOPE item.
pub fn imap_envelope(env: &model::Envelope) -> Envelope<'static> {
    Envelope {
        date: nstring(env.date.as_deref()),
        subject: nstring(env.subject.as_deref()),
        from: addresses(&env.from),
        sender: addresses(&env.sender),
        reply_to: addresses(&env.reply_to),
        to: addresses(&env.to),
        cc: addresses(&env.cc),
        bcc: addresses(&env.bcc),
        in_reply_to: nstring(env.in_reply_to.as_deref()),
        message_id: nstring(env.message_id.as_deref()),
    }
}

fn addresses(list: &[model::Mailbox]) -> Vec<Address<'static>> {
    list.iter()
        .map(|mbx| Address {
            name: nstring(mbx.name.as_deref()),
            adl: NString(None),
            mailbox: nstring(mbx.mailbox.as_deref()),
            host: nstring(mbx.host.as_deref()),
        })
        .collect()
}

fn nstring(s: Option<&str>) -> NString<'static> {
    NString(s.and_then(|v| IString::try_from(v.to_string()).ok()))
}

fn istring_or(s: &str, fallback: &'static str) -> IString<'static> {
    IString::try_from(s.to_string()).unwrap_or_else(|_| IString::try_from(fallback).unwrap())
}

/// Stored structure → BODY / BODYSTRUCTURE item. `is_ext` selects the
/// extension fields (BODYSTRUCTURE carries them, BODY does not).
pub fn imap_structure(bs: &model::BodyStructure, is_ext: bool) -> Result<BodyStructure<'static>> {
    match bs {
        model::BodyStructure::Text {
            subtype,
            params,
            id,
            description,
            encoding,
            size,
            lines,
        } => Ok(BodyStructure::Single {
            body: FetchBody {
                basic: basic_fields(params, id, description, encoding, *size),
                specific: SpecificFields::Text {
                    subtype: istring_or(subtype, "plain"),
                    number_of_lines: *lines,
                },
            },
            extension_data: single_ext(is_ext),
        }),
        model::BodyStructure::Basic {
            media_type,
            subtype,
            params,
            id,
            description,
            encoding,
            size,
        } => Ok(BodyStructure::Single {
            body: FetchBody {
                basic: basic_fields(params, id, description, encoding, *size),
                specific: SpecificFields::Basic {
                    r#type: istring_or(media_type, "application"),
                    subtype: istring_or(subtype, "octet-stream"),
                },
            },
            extension_data: single_ext(is_ext),
        }),
        model::BodyStructure::Message {
            params,
            envelope,
            inner,
            size,
            lines,
        } => Ok(BodyStructure::Single {
            body: FetchBody {
                basic: basic_fields(params, &None, &None, "7bit", *size),
                specific: SpecificFields::Message {
                    envelope: Box::new(imap_envelope(envelope)),
                    body_structure: Box::new(imap_structure(inner, is_ext)?),
                    number_of_lines: *lines,
                },
            },
            extension_data: single_ext(is_ext),
        }),
        model::BodyStructure::Multipart {
            subtype,
            params,
            parts,
        } => {
            let inner_bodies = parts
                .iter()
                .filter_map(|p| imap_structure(p, is_ext).ok())
                .collect::<Vec<_>>();
            NonEmptyVec::validate(&inner_bodies)?;
            Ok(BodyStructure::Multi {
                bodies: NonEmptyVec::unvalidated(inner_bodies),
                subtype: istring_or(subtype, "mixed"),
                extension_data: is_ext.then(|| MultiPartExtensionData {
                    parameter_list: param_list(params),
                    tail: None,
                }),
            })
        }
    }
}

fn basic_fields(
    params: &[(String, String)],
    id: &Option<String>,
    description: &Option<String>,
    encoding: &str,
    size: u32,
) -> BasicFields<'static> {
    BasicFields {
        parameter_list: param_list(params),
        id: nstring(id.as_deref()),
        description: nstring(description.as_deref()),
        content_transfer_encoding: istring_or(encoding, "7bit"),
        size,
    }
}

fn param_list(params: &[(String, String)]) -> Vec<(IString<'static>, IString<'static>)> {
    params
        .iter()
        .filter_map(|(k, v)| {
            Some((
                IString::try_from(k.clone()).ok()?,
                IString::try_from(v.clone()).ok()?,
            ))
        })
        .collect()
}

fn single_ext(is_ext: bool) -> Option<SinglePartExtensionData<'static>> {
    is_ext.then(|| SinglePartExtensionData {
        md5: NString(None),
        tail: None,
    })
}

// ---- BODY[<section>]<<partial>> over the raw bytes ----

pub enum BodySection<'a> {
    Full(Cow<'a, [u8]>),
    Slice {
        body: Cow<'a, [u8]>,
        origin_octet: u32,
    },
}

/// Resolve a section fetch in three steps: walk the MIME tree down the part
/// path, apply the extraction (TEXT, HEADER, ...), then subset with the
/// partial range.
pub fn body_ext<'a>(
    part: &'a AnyPart<'a>,
    section: &'a Option<FetchSection<'a>>,
    partial: &'a Option<(u32, NonZeroU32)>,
) -> Result<BodySection<'a>> {
    let (extractor, path) = SubsettedSection::from(section);
    let selected = subset(part, path)?;
    let extracted = extract(selected, &extractor)?;
    Ok(to_body_section(extracted, partial))
}

enum SubsettedSection<'a> {
    Part,
    Header,
    HeaderFields(&'a NonEmptyVec<AString<'a>>),
    HeaderFieldsNot(&'a NonEmptyVec<AString<'a>>),
    Text,
    Mime,
}

impl<'a> SubsettedSection<'a> {
    fn from(section: &'a Option<FetchSection>) -> (Self, Option<&'a FetchPart>) {
        match section {
            Some(FetchSection::Text(maybe_part)) => (Self::Text, maybe_part.as_ref()),
            Some(FetchSection::Header(maybe_part)) => (Self::Header, maybe_part.as_ref()),
            Some(FetchSection::HeaderFields(maybe_part, fields)) => {
                (Self::HeaderFields(fields), maybe_part.as_ref())
            }
            Some(FetchSection::HeaderFieldsNot(maybe_part, fields)) => {
                (Self::HeaderFieldsNot(fields), maybe_part.as_ref())
            }
            Some(FetchSection::Mime(part)) => (Self::Mime, Some(part)),
            Some(FetchSection::Part(part)) => (Self::Part, Some(part)),
            None => (Self::Part, None),
        }
    }
}

/// Walk the part path (e.g. `4.2.2`) down the MIME tree.
fn subset<'a>(part: &'a AnyPart<'a>, path: Option<&'a FetchPart>) -> Result<&'a AnyPart<'a>> {
    match path {
        None => Ok(part),
        Some(p) => rec_subset(part, p.0.as_ref()),
    }
}

fn rec_subset<'a>(part: &'a AnyPart<'a>, path: &[NonZeroU32]) -> Result<&'a AnyPart<'a>> {
    if path.is_empty() {
        return Ok(part);
    }
    match part {
        AnyPart::Mult(x) => {
            let next = x
                .children
                .get(path[0].get() as usize - 1)
                .ok_or(anyhow!("part path out of range"))?;
            rec_subset(next, &path[1..])
        }
        AnyPart::Msg(x) => rec_subset(x.child.as_ref(), path),
        _ => bail!("cannot address a subpart of an atomic part"),
    }
}

fn extract<'a>(part: &'a AnyPart<'a>, extractor: &SubsettedSection<'a>) -> Result<Cow<'a, [u8]>> {
    match extractor {
        SubsettedSection::Text => {
            let msg = part
                .as_message()
                .ok_or(anyhow!("TEXT requires a message/rfc822 part"))?;
            Ok(msg.raw_body.into())
        }
        SubsettedSection::Header => {
            let msg = part
                .as_message()
                .ok_or(anyhow!("HEADER requires a message/rfc822 part"))?;
            Ok(msg.raw_headers.into())
        }
        SubsettedSection::HeaderFields(fields) => Ok(header_fields(part, fields, false)),
        SubsettedSection::HeaderFieldsNot(fields) => Ok(header_fields(part, fields, true)),
        SubsettedSection::Mime => {
            let bytes = match part {
                AnyPart::Txt(p) => p.mime.fields.raw,
                AnyPart::Bin(p) => p.mime.fields.raw,
                AnyPart::Msg(p) => p.child.mime().raw,
                AnyPart::Mult(p) => p.mime.fields.raw,
            };
            Ok(bytes.into())
        }
        SubsettedSection::Part => {
            let bytes = match part {
                AnyPart::Txt(p) => p.body,
                AnyPart::Bin(p) => p.body,
                AnyPart::Msg(p) => p.raw_part,
                AnyPart::Mult(_) => bail!("a multipart has no directly fetchable body"),
            };
            Ok(bytes.into())
        }
    }
}

/// Field-name matching is case-insensitive but otherwise exact (RFC 3501).
fn header_fields<'a>(
    part: &'a AnyPart<'a>,
    fields: &'a NonEmptyVec<AString<'a>>,
    invert: bool,
) -> Cow<'a, [u8]> {
    let index = fields
        .as_ref()
        .iter()
        .map(|x| {
            match x {
                AString::Atom(a) => a.inner().as_bytes(),
                AString::String(IString::Literal(l)) => l.as_ref(),
                AString::String(IString::Quoted(q)) => q.inner().as_bytes(),
            }
            .to_ascii_lowercase()
        })
        .collect::<HashSet<_>>();

    let mime = match part {
        AnyPart::Msg(msg) => msg.child.mime(),
        other => other.mime(),
    };

    let buffer = mime
        .kv
        .iter()
        .filter_map(|field| match field {
            header::Field::Good(header::Kv2(k, v)) => Some((k, v)),
            _ => None,
        })
        .filter(|(k, _)| index.contains(&k.to_ascii_lowercase()) ^ invert)
        .fold(vec![], |mut acc, (k, v)| {
            acc.extend(*k);
            acc.extend(b": ");
            acc.extend(*v);
            acc.extend(b"\r\n");
            acc
        });

    buffer.into()
}

/// Apply the `<origin.len>` partial subset. A partial fetch beyond the end
/// of the text truncates; one starting past the end returns empty bytes.
fn to_body_section<'a>(
    bytes: Cow<'a, [u8]>,
    partial: &Option<(u32, NonZeroU32)>,
) -> BodySection<'a> {
    match partial {
        None => BodySection::Full(bytes),
        Some((begin, len)) => {
            let begin_idx = *begin as usize;
            if begin_idx > bytes.len() {
                return BodySection::Slice {
                    body: Cow::Borrowed(&[][..]),
                    origin_octet: *begin,
                };
            }
            let end_idx = std::cmp::min(begin_idx + len.get() as usize, bytes.len());
            let body = match bytes {
                Cow::Borrowed(b) => Cow::Borrowed(&b[begin_idx..end_idx]),
                Cow::Owned(b) => Cow::Owned(b[begin_idx..end_idx].to_vec()),
            };
            BodySection::Slice {
                body,
                origin_octet: *begin,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MSG: &[u8] = b"From: a@a.a\r
To: b@b.b\r
Subject: sections\r
MIME-Version: 1.0\r
Content-Type: multipart/mixed; boundary=\"xyz\"\r
\r
--xyz\r
Content-Type: text/plain\r
\r
first part\r
--xyz\r
Content-Type: text/html\r
\r
<p>second</p>\r
--xyz--\r
";

    fn parse(raw: &[u8]) -> eml_codec::part::composite::Message<'_> {
        eml_codec::parse_message(raw).unwrap().1
    }

    #[test]
    fn full_body_section() {
        let msg = parse(MSG);
        let part = AnyPart::Msg(msg);
        let out = body_ext(&part, &None, &None).unwrap();
        match out {
            BodySection::Full(bytes) => assert!(!bytes.is_empty()),
            _ => panic!("expected full section"),
        }
    }

    #[test]
    fn numbered_part_section() {
        let msg = parse(MSG);
        let part = AnyPart::Msg(msg);
        let section = Some(FetchSection::Part(FetchPart(
            vec![NonZeroU32::new(1).unwrap()].try_into().unwrap(),
        )));
        let out = body_ext(&part, &section, &None).unwrap();
        match out {
            BodySection::Full(bytes) => {
                assert!(String::from_utf8_lossy(&bytes).contains("first part"))
            }
            _ => panic!("expected full section"),
        }
    }

    #[test]
    fn partial_truncates() {
        let msg = parse(MSG);
        let part = AnyPart::Msg(msg);
        let partial = Some((0u32, NonZeroU32::new(5).unwrap()));
        let out = body_ext(&part, &None, &partial).unwrap();
        match out {
            BodySection::Slice { body, origin_octet } => {
                assert_eq!(origin_octet, 0);
                assert_eq!(body.len(), 5);
            }
            _ => panic!("expected slice"),
        }
    }

    #[test]
    fn stored_structure_converts() {
        let bs = model::BodyStructure::Text {
            subtype: "plain".into(),
            params: vec![("charset".into(), "utf-8".into())],
            id: None,
            description: None,
            encoding: "7bit".into(),
            size: 11,
            lines: 1,
        };
        let imap = imap_structure(&bs, true).unwrap();
        match imap {
            BodyStructure::Single { body, .. } => match body.specific {
                SpecificFields::Text {
                    number_of_lines, ..
                } => assert_eq!(number_of_lines, 1),
                _ => panic!("expected text"),
            },
            _ => panic!("expected single"),
        }
    }
}
