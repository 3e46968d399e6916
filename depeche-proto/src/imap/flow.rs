use std::fmt;
use std::sync::Arc;

use imap_codec::imap_types::core::Tag;
use tokio::sync::Notify;

use crate::imap::mailbox_view::MailboxView;
use crate::Account;

#[derive(Debug)]
pub enum Error {
    ForbiddenTransition,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "forbidden state transition")
    }
}

impl std::error::Error for Error {}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MailboxPerm {
    ReadOnly,
    ReadWrite,
}

/// RFC 3501 §3 session states, plus IDLE as its own state so that a
/// mid-IDLE command is unrepresentable rather than merely rejected.
pub enum State {
    NotAuthenticated,
    Authenticated(Account),
    Selected(Account, MailboxView, MailboxPerm),
    Idle(Account, MailboxView, MailboxPerm, Tag<'static>, Arc<Notify>),
    Logout,
}

pub enum Transition {
    None,
    Authenticate(Account),
    Select(MailboxView, MailboxPerm),
    Unselect,
    Idle(Tag<'static>, Notify),
    UnIdle,
    Logout,
}

impl State {
    pub fn apply(&mut self, tr: Transition) -> Result<(), Error> {
        let prev = std::mem::replace(self, State::Logout);
        let next = match (prev, tr) {
            (prev, Transition::None) => prev,
            (State::NotAuthenticated, Transition::Authenticate(account)) => {
                State::Authenticated(account)
            }
            (State::Authenticated(account), Transition::Select(view, perm))
            | (State::Selected(account, _, _), Transition::Select(view, perm)) => {
                State::Selected(account, view, perm)
            }
            (State::Selected(account, _, _), Transition::Unselect) => State::Authenticated(account),
            (State::Selected(account, view, perm), Transition::Idle(tag, stop)) => {
                State::Idle(account, view, perm, tag, Arc::new(stop))
            }
            (State::Idle(account, view, perm, _, _), Transition::UnIdle) => {
                State::Selected(account, view, perm)
            }
            (_, Transition::Logout) => State::Logout,
            (prev, _) => {
                *self = prev;
                return Err(Error::ForbiddenTransition);
            }
        };
        *self = next;
        Ok(())
    }

    pub fn notify(&self) -> Option<Arc<Notify>> {
        match self {
            Self::Idle(.., stop) => Some(stop.clone()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account() -> Account {
        Account {
            id: 1,
            address: "alice@example.com".into(),
        }
    }

    #[test]
    fn login_then_logout() {
        let mut st = State::NotAuthenticated;
        st.apply(Transition::Authenticate(account())).unwrap();
        assert!(matches!(st, State::Authenticated(_)));
        st.apply(Transition::Logout).unwrap();
        assert!(matches!(st, State::Logout));
    }

    #[test]
    fn illegal_transitions_keep_state() {
        let mut st = State::NotAuthenticated;
        assert!(st.apply(Transition::Unselect).is_err());
        assert!(matches!(st, State::NotAuthenticated));

        let mut st = State::Authenticated(account());
        assert!(st.apply(Transition::Authenticate(account())).is_err());
        assert!(matches!(st, State::Authenticated(_)));
    }

    #[test]
    fn idle_needs_a_selected_mailbox() {
        let mut st = State::Authenticated(account());
        assert!(st
            .apply(Transition::Idle(
                Tag::try_from("A1").unwrap(),
                Notify::new()
            ))
            .is_err());
    }
}
