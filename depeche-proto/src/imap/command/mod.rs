pub mod anonymous;
pub mod anystate;
pub mod authenticated;
pub mod selected;

use imap_codec::imap_types::core::{AString, IString};
use imap_codec::imap_types::mailbox::Mailbox as MailboxCodec;
use imap_codec::imap_types::response::{Code, CodeOther};

use depeche_meta::model::INBOX;
use depeche_user::error::Error;

/// Convert an IMAP mailbox name representation to the utf-8 string used
/// internally.
pub struct MailboxName<'a>(pub &'a MailboxCodec<'a>);

impl<'a> TryInto<&'a str> for MailboxName<'a> {
    type Error = std::str::Utf8Error;
    fn try_into(self) -> Result<&'a str, Self::Error> {
        match self.0 {
            MailboxCodec::Inbox => Ok(INBOX),
            MailboxCodec::Other(aname) => Ok(std::str::from_utf8(aname.as_ref())?),
        }
    }
}

/// Owned text of an astring, whatever its wire form was.
pub fn astring_text(x: &AString) -> String {
    match x {
        AString::Atom(a) => a.inner().to_string(),
        AString::String(IString::Literal(l)) => String::from_utf8_lossy(l.as_ref()).into_owned(),
        AString::String(IString::Quoted(q)) => q.inner().to_string(),
    }
}

/// RFC 5530-style response code for an error kind surfaced to the client.
pub fn error_code(e: &Error) -> Option<Code<'static>> {
    let token: &[u8] = match e {
        Error::NotFound(_) => b"NONEXISTENT",
        Error::AlreadyExists(_) => b"ALREADYEXISTS",
        Error::AuthFailed => b"AUTHENTICATIONFAILED",
        Error::Permission(_) => b"NOPERM",
        Error::TransientIo(_) | Error::Internal(_) => b"SERVERBUG",
        Error::MalformedMessage(_) | Error::Cancelled => return None,
    };
    Some(Code::Other(CodeOther::unvalidated(token.to_vec())))
}

/// Match an IMAP LIST pattern: `*` crosses hierarchy delimiters, `%` does
/// not.
pub fn list_pattern_matches(pattern: &str, name: &str) -> bool {
    fn rec(p: &[u8], n: &[u8]) -> bool {
        match p.first() {
            None => n.is_empty(),
            Some(b'*') => (0..=n.len()).any(|i| rec(&p[1..], &n[i..])),
            Some(b'%') => {
                // Match any run not containing '/'.
                (0..=n.len())
                    .take_while(|&i| i == 0 || n[i - 1] != b'/')
                    .any(|i| rec(&p[1..], &n[i..]))
            }
            Some(c) => n.first() == Some(c) && rec(&p[1..], &n[1..]),
        }
    }
    rec(pattern.as_bytes(), name.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn star_crosses_hierarchy() {
        assert!(list_pattern_matches("*", "Work/2024/Q1"));
        assert!(list_pattern_matches("Work/*", "Work/2024/Q1"));
        assert!(!list_pattern_matches("Home/*", "Work/2024"));
    }

    #[test]
    fn percent_stops_at_delimiter() {
        assert!(list_pattern_matches("%", "INBOX"));
        assert!(!list_pattern_matches("%", "Work/2024"));
        assert!(list_pattern_matches("Work/%", "Work/2024"));
        assert!(!list_pattern_matches("Work/%", "Work/2024/Q1"));
    }

    #[test]
    fn literal_match() {
        assert!(list_pattern_matches("INBOX", "INBOX"));
        assert!(!list_pattern_matches("INBOX", "INBOX/sub"));
    }
}
