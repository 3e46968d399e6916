use std::collections::HashSet;

use imap_codec::imap_types::core::NonEmptyVec;
use imap_codec::imap_types::response::Capability;

fn capability_unselect() -> Capability<'static> {
    Capability::try_from("UNSELECT").unwrap()
}

/// What this server advertises: IMAP4rev1 with MOVE, IDLE and UNSELECT.
#[derive(Debug, Clone)]
pub struct ServerCapability(HashSet<Capability<'static>>);

impl Default for ServerCapability {
    fn default() -> Self {
        Self(HashSet::from([
            Capability::Imap4Rev1,
            Capability::Move,
            Capability::Idle,
            capability_unselect(),
        ]))
    }
}

impl ServerCapability {
    pub fn to_vec(&self) -> NonEmptyVec<Capability<'static>> {
        self.0
            .iter()
            .cloned()
            .collect::<Vec<_>>()
            .try_into()
            .unwrap()
    }
}
