use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use depeche_user::blob::BlobId;

pub type AccountId = i64;
pub type MailboxId = i64;
pub type MessageId = i64;
pub type UploadId = i64;
pub type ModSeq = i64;

/// The six mailboxes every account gets at first login. They cannot be
/// deleted or renamed.
pub const DEFAULT_MAILBOXES: [&str; 6] = ["INBOX", "Sent", "Drafts", "Archive", "Junk", "Trash"];
pub const INBOX: &str = "INBOX";
pub const TRASH: &str = "Trash";

pub fn is_default_mailbox(name: &str) -> bool {
    DEFAULT_MAILBOXES
        .iter()
        .any(|d| d.eq_ignore_ascii_case(name))
}

// ---- flags ----

/// System flags packed into an integer column.
pub mod flag_bits {
    pub const SEEN: i32 = 1 << 0;
    pub const ANSWERED: i32 = 1 << 1;
    pub const FLAGGED: i32 = 1 << 2;
    pub const DELETED: i32 = 1 << 3;
    pub const DRAFT: i32 = 1 << 4;
    pub const RECENT: i32 = 1 << 5;
}

/// Packed system flags plus the open set of keyword flags.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FlagSet {
    pub bits: i32,
    pub custom: Vec<String>,
}

impl FlagSet {
    pub fn new(bits: i32) -> Self {
        Self {
            bits,
            custom: Vec::new(),
        }
    }

    pub fn has(&self, bit: i32) -> bool {
        self.bits & bit != 0
    }

    pub fn from_strings<'a>(flags: impl IntoIterator<Item = &'a str>) -> Self {
        let mut out = Self::default();
        for f in flags {
            match system_bit(f) {
                Some(bit) => out.bits |= bit,
                None => {
                    if !out.custom.iter().any(|c| c.eq_ignore_ascii_case(f)) {
                        out.custom.push(f.to_string());
                    }
                }
            }
        }
        out
    }

    pub fn to_strings(&self) -> Vec<String> {
        let mut out = Vec::new();
        for (bit, name) in SYSTEM_FLAGS {
            if self.bits & bit != 0 {
                out.push((*name).to_string());
            }
        }
        out.extend(self.custom.iter().cloned());
        out
    }

    pub fn union(&self, other: &FlagSet) -> FlagSet {
        let mut custom = self.custom.clone();
        for f in &other.custom {
            if !custom.iter().any(|c| c.eq_ignore_ascii_case(f)) {
                custom.push(f.clone());
            }
        }
        FlagSet {
            bits: self.bits | other.bits,
            custom,
        }
    }

    pub fn difference(&self, other: &FlagSet) -> FlagSet {
        FlagSet {
            bits: self.bits & !other.bits,
            custom: self
                .custom
                .iter()
                .filter(|c| !other.custom.iter().any(|o| o.eq_ignore_ascii_case(c)))
                .cloned()
                .collect(),
        }
    }
}

const SYSTEM_FLAGS: &[(i32, &str)] = &[
    (flag_bits::SEEN, "\\Seen"),
    (flag_bits::ANSWERED, "\\Answered"),
    (flag_bits::FLAGGED, "\\Flagged"),
    (flag_bits::DELETED, "\\Deleted"),
    (flag_bits::DRAFT, "\\Draft"),
    (flag_bits::RECENT, "\\Recent"),
];

pub fn system_bit(flag: &str) -> Option<i32> {
    SYSTEM_FLAGS
        .iter()
        .find(|(_, name)| name.eq_ignore_ascii_case(flag))
        .map(|(bit, _)| *bit)
}

// ---- envelope & body structure ----

/// RFC 3501 §7.4.2 envelope, extracted once at ingest and stored next to the
/// message metadata so FETCH ENVELOPE never touches the body.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub date: Option<String>,
    pub subject: Option<String>,
    pub from: Vec<Mailbox>,
    pub sender: Vec<Mailbox>,
    pub reply_to: Vec<Mailbox>,
    pub to: Vec<Mailbox>,
    pub cc: Vec<Mailbox>,
    pub bcc: Vec<Mailbox>,
    pub in_reply_to: Option<String>,
    pub message_id: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mailbox {
    pub name: Option<String>,
    pub mailbox: Option<String>,
    pub host: Option<String>,
}

/// MIME structure, extracted once at ingest. Serves FETCH BODY and
/// BODYSTRUCTURE without re-reading the blob.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BodyStructure {
    Text {
        subtype: String,
        params: Vec<(String, String)>,
        id: Option<String>,
        description: Option<String>,
        encoding: String,
        size: u32,
        lines: u32,
    },
    Basic {
        media_type: String,
        subtype: String,
        params: Vec<(String, String)>,
        id: Option<String>,
        description: Option<String>,
        encoding: String,
        size: u32,
    },
    Message {
        params: Vec<(String, String)>,
        envelope: Box<Envelope>,
        inner: Box<BodyStructure>,
        size: u32,
        lines: u32,
    },
    Multipart {
        subtype: String,
        params: Vec<(String, String)>,
        parts: Vec<BodyStructure>,
    },
}

// ---- recipients ----

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecipientKind {
    From = 0,
    To = 1,
    Cc = 2,
    Bcc = 3,
}

impl RecipientKind {
    pub fn from_i16(v: i16) -> Self {
        match v {
            0 => Self::From,
            1 => Self::To,
            2 => Self::Cc,
            _ => Self::Bcc,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Recipient {
    pub kind: RecipientKind,
    pub address: String,
    pub name: Option<String>,
}

// ---- rows ----

#[derive(Clone, Debug)]
pub struct MailboxRow {
    pub mailbox_id: MailboxId,
    pub account_id: AccountId,
    pub name: String,
    pub parent_id: Option<MailboxId>,
    pub uid_validity: u32,
    pub subscribed: bool,
}

#[derive(Clone, Debug)]
pub struct MailboxSummary {
    pub num_messages: u32,
    pub recent: u32,
    pub unseen: u32,
    pub first_unseen: Option<u32>,
    pub uid_next: u32,
    pub uid_validity: u32,
    pub highest_modseq: ModSeq,
}

#[derive(Clone, Debug)]
pub struct MessageRow {
    pub message_id: MessageId,
    pub mailbox_id: MailboxId,
    pub uid: u32,
    pub blob: BlobId,
    pub flags: FlagSet,
    pub internal_date: DateTime<Utc>,
    pub sent_date: Option<DateTime<Utc>>,
    pub size: u64,
    pub subject: String,
    pub message_id_header: Option<String>,
    pub uploaded: bool,
    pub modseq: ModSeq,
}

/// What a new message carries into `insert_message`.
#[derive(Clone, Debug)]
pub struct NewMessage {
    pub mailbox_id: MailboxId,
    pub blob: BlobId,
    pub flags: FlagSet,
    pub internal_date: DateTime<Utc>,
    pub sent_date: Option<DateTime<Utc>>,
    pub size: u64,
    pub subject: String,
    pub message_id_header: Option<String>,
    pub in_reply_to: Vec<String>,
    pub envelope: Envelope,
    pub body_structure: BodyStructure,
    pub recipients: Vec<Recipient>,
    pub plaintext_body: Option<String>,
}

/// Where the ingest body callback durably put the bytes.
#[derive(Clone, Debug)]
pub enum BodyLocation {
    /// On the local staging spool; a pending-upload row must track it.
    Staged { path: PathBuf },
    /// Already in the object store; nothing left to upload.
    Stored,
}

#[derive(Clone, Debug)]
pub struct PendingUpload {
    pub upload_id: UploadId,
    pub message_id: MessageId,
    pub blob: BlobId,
    pub staging_path: PathBuf,
    pub size: u64,
    pub attempts: i32,
}

#[derive(Clone, Debug)]
pub struct PollUpdate {
    pub uid: u32,
    pub flags: FlagSet,
    pub is_expunge: bool,
    pub modseq: ModSeq,
}

#[derive(Clone, Debug)]
pub struct PollResult {
    pub num_messages: u32,
    pub highest_modseq: ModSeq,
    pub updates: Vec<PollUpdate>,
}

#[derive(Clone, Debug)]
pub struct SieveScript {
    pub name: String,
    pub content: String,
    pub active: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_strings_roundtrip() {
        let set = FlagSet::from_strings(["\\Seen", "\\Deleted", "$Forwarded", "\\seen"]);
        assert!(set.has(flag_bits::SEEN));
        assert!(set.has(flag_bits::DELETED));
        assert!(!set.has(flag_bits::DRAFT));
        assert_eq!(set.custom, vec!["$Forwarded".to_string()]);

        let strings = set.to_strings();
        assert_eq!(strings, vec!["\\Seen", "\\Deleted", "$Forwarded"]);
        assert_eq!(FlagSet::from_strings(strings.iter().map(|s| s.as_str())), set);
    }

    #[test]
    fn union_and_difference() {
        let a = FlagSet::from_strings(["\\Seen", "$A"]);
        let b = FlagSet::from_strings(["\\Deleted", "$A", "$B"]);

        let u = a.union(&b);
        assert!(u.has(flag_bits::SEEN) && u.has(flag_bits::DELETED));
        assert_eq!(u.custom, vec!["$A".to_string(), "$B".to_string()]);

        let d = u.difference(&FlagSet::from_strings(["\\Seen", "$B"]));
        assert!(!d.has(flag_bits::SEEN));
        assert!(d.has(flag_bits::DELETED));
        assert_eq!(d.custom, vec!["$A".to_string()]);
    }

    #[test]
    fn default_mailboxes_case_insensitive() {
        assert!(is_default_mailbox("inbox"));
        assert!(is_default_mailbox("Trash"));
        assert!(!is_default_mailbox("Work"));
    }
}
