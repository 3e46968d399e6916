use chrono::{DateTime, Utc};

use eml_codec::{
    imf,
    mime::{self, r#type::Deductible},
    part::{composite, discrete, AnyPart},
};

use depeche_meta::model::{
    BodyStructure, Envelope, FlagSet, Mailbox, MailboxId, NewMessage, Recipient, RecipientKind,
};
use depeche_user::blob::BlobId;
use depeche_user::error::{Error, Result};

/// Everything the metadata store needs to know about a message, extracted in
/// one parse at ingest time. The raw bytes are hashed here too: the hash is
/// the body's address in every storage tier.
pub struct ParsedMessage {
    pub blob: BlobId,
    pub size: u64,
    pub subject: String,
    pub message_id_header: Option<String>,
    pub in_reply_to: Vec<String>,
    pub sent_date: Option<DateTime<Utc>>,
    pub envelope: Envelope,
    pub body_structure: BodyStructure,
    pub recipients: Vec<Recipient>,
    pub plaintext_body: Option<String>,
}

impl ParsedMessage {
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let (_, message) =
            eml_codec::parse_message(raw).map_err(|_| Error::malformed("unparseable message"))?;

        let imf = &message.imf;
        Ok(Self {
            blob: BlobId::of(raw),
            size: raw.len() as u64,
            subject: imf
                .subject
                .as_ref()
                .map(|s| s.to_string())
                .unwrap_or_default(),
            message_id_header: imf.msg_id.as_ref().map(|m| m.to_string()),
            in_reply_to: imf.in_reply_to.iter().map(|m| m.to_string()).collect(),
            sent_date: imf.date.as_ref().map(|d| d.with_timezone(&Utc)),
            envelope: envelope_of(imf),
            body_structure: structure_of(&message.child),
            recipients: recipients_of(imf),
            plaintext_body: plaintext_of(&message.child),
        })
    }

    pub fn into_new_message(
        self,
        mailbox_id: MailboxId,
        flags: FlagSet,
        internal_date: DateTime<Utc>,
    ) -> NewMessage {
        NewMessage {
            mailbox_id,
            blob: self.blob,
            flags,
            internal_date,
            sent_date: self.sent_date,
            size: self.size,
            subject: self.subject,
            message_id_header: self.message_id_header,
            in_reply_to: self.in_reply_to,
            envelope: self.envelope,
            body_structure: self.body_structure,
            recipients: self.recipients,
            plaintext_body: self.plaintext_body,
        }
    }
}

/// Envelope rules from RFC 3501 §7.4.2: absent Sender / Reply-To fall back
/// to From; Date, Subject, In-Reply-To and Message-ID may be NIL.
pub fn envelope_of(msg: &imf::Imf) -> Envelope {
    let from = msg.from.iter().map(convert_mbx).collect::<Vec<_>>();

    Envelope {
        date: msg.date.as_ref().map(|d| d.to_rfc2822()),
        subject: msg.subject.as_ref().map(|s| s.to_string()),
        sender: msg
            .sender
            .as_ref()
            .map(|v| vec![convert_mbx(v)])
            .unwrap_or_else(|| from.clone()),
        reply_to: if msg.reply_to.is_empty() {
            from.clone()
        } else {
            convert_addresses(&msg.reply_to)
        },
        from,
        to: convert_addresses(&msg.to),
        cc: convert_addresses(&msg.cc),
        bcc: convert_addresses(&msg.bcc),
        in_reply_to: msg.in_reply_to.iter().next().map(|m| m.to_string()),
        message_id: msg.msg_id.as_ref().map(|m| m.to_string()),
    }
}

fn convert_addresses(addrlist: &Vec<imf::address::AddressRef>) -> Vec<Mailbox> {
    let mut acc = vec![];
    for item in addrlist {
        match item {
            imf::address::AddressRef::Single(a) => acc.push(convert_mbx(a)),
            imf::address::AddressRef::Many(l) => acc.extend(l.participants.iter().map(convert_mbx)),
        }
    }
    acc
}

fn convert_mbx(addr: &imf::mailbox::MailboxRef) -> Mailbox {
    Mailbox {
        name: addr.name.as_ref().map(|x| x.to_string()),
        mailbox: Some(addr.addrspec.local_part.to_string()),
        host: Some(addr.addrspec.domain.to_string()),
    }
}

fn recipients_of(msg: &imf::Imf) -> Vec<Recipient> {
    let mut out = Vec::new();
    for m in msg.from.iter() {
        out.push(recipient(RecipientKind::From, convert_mbx(m)));
    }
    for (kind, list) in [
        (RecipientKind::To, &msg.to),
        (RecipientKind::Cc, &msg.cc),
        (RecipientKind::Bcc, &msg.bcc),
    ] {
        for mbx in convert_addresses(list) {
            out.push(recipient(kind, mbx));
        }
    }
    out
}

fn recipient(kind: RecipientKind, mbx: Mailbox) -> Recipient {
    Recipient {
        kind,
        address: format!(
            "{}@{}",
            mbx.mailbox.as_deref().unwrap_or(""),
            mbx.host.as_deref().unwrap_or("")
        ),
        name: mbx.name,
    }
}

// ---- body structure ----

fn structure_of(part: &AnyPart) -> BodyStructure {
    match part {
        AnyPart::Txt(x) => text_structure(x),
        AnyPart::Bin(x) => binary_structure(x),
        AnyPart::Mult(x) => multipart_structure(x),
        AnyPart::Msg(x) => message_structure(x),
    }
}

fn text_structure(x: &discrete::Text) -> BodyStructure {
    let m = &x.mime.fields;
    let itype = match &x.mime.interpreted_type {
        Deductible::Inferred(v) | Deductible::Explicit(v) => v,
    };

    let mut params = params_of(m);
    // An inferred charset does not appear among the parsed parameters.
    if let Deductible::Inferred(charset) = &itype.charset {
        params.push(("charset".into(), charset.to_string()));
    }

    BodyStructure::Text {
        subtype: itype.subtype.to_string(),
        params,
        id: m.id.as_ref().map(|v| v.to_string()),
        description: m.description.as_ref().map(|v| v.to_string()),
        encoding: encoding_of(m),
        size: x.body.len() as u32,
        lines: lines_of(x.body),
    }
}

fn binary_structure(x: &discrete::Binary) -> BodyStructure {
    let m = &x.mime.fields;
    let (media_type, subtype) = m
        .ctype
        .as_ref()
        .map(|ct| {
            (
                String::from_utf8_lossy(ct.main).to_string(),
                String::from_utf8_lossy(ct.sub).to_string(),
            )
        })
        .unwrap_or_else(|| ("application".into(), "octet-stream".into()));

    BodyStructure::Basic {
        media_type,
        subtype,
        params: params_of(m),
        id: m.id.as_ref().map(|v| v.to_string()),
        description: m.description.as_ref().map(|v| v.to_string()),
        encoding: encoding_of(m),
        size: x.body.len() as u32,
    }
}

fn multipart_structure(x: &composite::Multipart) -> BodyStructure {
    BodyStructure::Multipart {
        subtype: x.mime.interpreted_type.subtype.to_string(),
        params: vec![(
            "boundary".into(),
            x.mime.interpreted_type.boundary.to_string(),
        )],
        parts: x.children.iter().map(structure_of).collect(),
    }
}

fn message_structure(x: &composite::Message) -> BodyStructure {
    BodyStructure::Message {
        params: params_of(x.child.mime()),
        envelope: Box::new(envelope_of(&x.imf)),
        inner: Box::new(structure_of(&x.child)),
        size: x.raw_part.len() as u32,
        lines: lines_of(x.raw_part),
    }
}

fn params_of(m: &mime::NaiveMIME) -> Vec<(String, String)> {
    m.ctype
        .as_ref()
        .map(|ct| {
            ct.params
                .iter()
                .map(|p| {
                    (
                        String::from_utf8_lossy(p.name).to_string(),
                        p.value.to_string(),
                    )
                })
                .collect()
        })
        .unwrap_or_default()
}

fn encoding_of(m: &mime::NaiveMIME) -> String {
    match m.transfer_encoding {
        mime::mechanism::Mechanism::_8Bit => "8bit",
        mime::mechanism::Mechanism::Binary => "binary",
        mime::mechanism::Mechanism::QuotedPrintable => "quoted-printable",
        mime::mechanism::Mechanism::Base64 => "base64",
        _ => "7bit",
    }
    .into()
}

fn lines_of(input: &[u8]) -> u32 {
    input.iter().filter(|x| **x == b'\n').count() as u32
}

/// First text/plain leaf, decoded lossily. Feeds the search index.
fn plaintext_of(part: &AnyPart) -> Option<String> {
    match part {
        AnyPart::Txt(x) => {
            let is_plain = match &x.mime.interpreted_type {
                Deductible::Inferred(v) | Deductible::Explicit(v) => {
                    v.subtype.to_string().eq_ignore_ascii_case("plain")
                }
            };
            is_plain.then(|| String::from_utf8_lossy(x.body).to_string())
        }
        AnyPart::Mult(x) => x.children.iter().find_map(plaintext_of),
        AnyPart::Msg(x) => plaintext_of(&x.child),
        AnyPart::Bin(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIMPLE: &[u8] = b"Date: Sat, 8 Jul 2023 07:14:29 +0200\r
From: Bob Robert <bob@example.tld>\r
To: Alice Malice <alice@example.tld>\r
Subject: hello\r
Message-ID: <msg-1@example.tld>\r
\r
Hello world!\r
";

    const MULTIPART: &[u8] = b"From: bob@example.tld\r
To: alice@example.tld\r
Subject: mixed\r
MIME-Version: 1.0\r
Content-Type: multipart/alternative; boundary=\"b1\"\r
\r
--b1\r
Content-Type: text/plain; charset=utf-8\r
\r
plain body\r
--b1\r
Content-Type: text/html; charset=us-ascii\r
\r
<b>html body</b>\r
--b1--\r
";

    #[test]
    fn simple_message_fields() {
        let parsed = ParsedMessage::parse(SIMPLE).unwrap();
        assert_eq!(parsed.subject, "hello");
        assert_eq!(parsed.message_id_header.as_deref(), Some("msg-1@example.tld"));
        assert_eq!(parsed.blob, BlobId::of(SIMPLE));
        assert_eq!(parsed.size, SIMPLE.len() as u64);
        assert!(parsed.sent_date.is_some());

        let env = &parsed.envelope;
        assert_eq!(env.subject.as_deref(), Some("hello"));
        assert_eq!(env.from.len(), 1);
        assert_eq!(env.from[0].mailbox.as_deref(), Some("bob"));
        assert_eq!(env.from[0].host.as_deref(), Some("example.tld"));
        // Sender and Reply-To fall back to From.
        assert_eq!(env.sender, env.from);
        assert_eq!(env.reply_to, env.from);

        assert!(parsed
            .plaintext_body
            .as_deref()
            .unwrap()
            .contains("Hello world!"));

        match &parsed.body_structure {
            BodyStructure::Text { subtype, .. } => assert_eq!(subtype, "plain"),
            other => panic!("expected text structure, got {:?}", other),
        }
    }

    #[test]
    fn multipart_structure_and_plaintext() {
        let parsed = ParsedMessage::parse(MULTIPART).unwrap();
        match &parsed.body_structure {
            BodyStructure::Multipart { subtype, parts, .. } => {
                assert_eq!(subtype, "alternative");
                assert_eq!(parts.len(), 2);
            }
            other => panic!("expected multipart, got {:?}", other),
        }
        assert!(parsed.plaintext_body.as_deref().unwrap().contains("plain body"));
    }

    #[test]
    fn recipients_cover_from_and_to() {
        let parsed = ParsedMessage::parse(SIMPLE).unwrap();
        let froms: Vec<_> = parsed
            .recipients
            .iter()
            .filter(|r| r.kind == RecipientKind::From)
            .collect();
        let tos: Vec<_> = parsed
            .recipients
            .iter()
            .filter(|r| r.kind == RecipientKind::To)
            .collect();
        assert_eq!(froms.len(), 1);
        assert_eq!(froms[0].address, "bob@example.tld");
        assert_eq!(tos.len(), 1);
        assert_eq!(tos[0].address, "alice@example.tld");
        assert_eq!(tos[0].name.as_deref(), Some("Alice Malice"));
    }

    #[test]
    fn identical_bodies_share_a_blob() {
        let a = ParsedMessage::parse(SIMPLE).unwrap();
        let b = ParsedMessage::parse(SIMPLE).unwrap();
        assert_eq!(a.blob, b.blob);
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(matches!(
            ParsedMessage::parse(b"\xff\xfe"),
            Err(Error::MalformedMessage(_))
        ));
    }
}
