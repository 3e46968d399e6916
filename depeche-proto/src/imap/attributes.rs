use imap_codec::imap_types::fetch::{MacroOrMessageDataItemNames, MessageDataItemName, Section};

/// Internal decisions based on the attributes the client asked to fetch.
pub struct AttributesProxy {
    pub attrs: Vec<MessageDataItemName<'static>>,
}

impl AttributesProxy {
    pub fn new(attrs: &MacroOrMessageDataItemNames<'static>, is_uid_fetch: bool) -> Self {
        // Expand macros
        let mut fetch_attrs = match attrs {
            MacroOrMessageDataItemNames::Macro(m) => {
                use imap_codec::imap_types::fetch::Macro;
                use MessageDataItemName::*;
                match m {
                    Macro::All => vec![Flags, InternalDate, Rfc822Size, Envelope],
                    Macro::Fast => vec![Flags, InternalDate, Rfc822Size],
                    Macro::Full => vec![Flags, InternalDate, Rfc822Size, Envelope, Body],
                    _ => {
                        tracing::error!("unimplemented macro");
                        vec![]
                    }
                }
            }
            MacroOrMessageDataItemNames::MessageDataItemNames(a) => a.clone(),
        };

        if is_uid_fetch && !fetch_attrs.contains(&MessageDataItemName::Uid) {
            fetch_attrs.push(MessageDataItemName::Uid);
        }

        Self { attrs: fetch_attrs }
    }

    pub fn need_envelope(&self) -> bool {
        self.attrs
            .iter()
            .any(|x| matches!(x, MessageDataItemName::Envelope))
    }

    pub fn need_structure(&self) -> bool {
        self.attrs.iter().any(|x| {
            matches!(
                x,
                MessageDataItemName::Body | MessageDataItemName::BodyStructure
            )
        })
    }

    /// Whether the raw bytes must be resolved through the storage tiers.
    /// Envelope and body structure are served from the catalog; only full
    /// message items and section fetches touch the blob.
    pub fn need_raw(&self) -> bool {
        self.attrs.iter().any(|x| match x {
            MessageDataItemName::Rfc822
            | MessageDataItemName::Rfc822Header
            | MessageDataItemName::Rfc822Text => true,
            MessageDataItemName::BodyExt { .. } => true,
            _ => false,
        })
    }

    /// Sections other than headers set `\Seen` when fetched without PEEK.
    pub fn is_seen_setting(&self) -> bool {
        self.attrs.iter().any(|x| {
            matches!(
                x,
                MessageDataItemName::Rfc822
                    | MessageDataItemName::Rfc822Text
                    | MessageDataItemName::BodyExt { peek: false, .. }
            )
        })
    }

    #[allow(dead_code)]
    pub fn needs_header_section_only(&self) -> bool {
        self.attrs.iter().all(|x| match x {
            MessageDataItemName::BodyExt {
                section: Some(section),
                ..
            } => matches!(
                section,
                Section::Header(None)
                    | Section::HeaderFields(None, _)
                    | Section::HeaderFieldsNot(None, _)
            ),
            _ => true,
        })
    }
}
