use imap_codec::imap_types::core::Atom;
use imap_codec::imap_types::flag::{Flag, FlagFetch};

use depeche_meta::model::FlagSet;

/// Stored flag string → wire flag.
pub fn from_str(f: &str) -> Option<FlagFetch<'static>> {
    match f.chars().next() {
        Some('\\') => match f {
            "\\Seen" => Some(FlagFetch::Flag(Flag::Seen)),
            "\\Answered" => Some(FlagFetch::Flag(Flag::Answered)),
            "\\Flagged" => Some(FlagFetch::Flag(Flag::Flagged)),
            "\\Deleted" => Some(FlagFetch::Flag(Flag::Deleted)),
            "\\Draft" => Some(FlagFetch::Flag(Flag::Draft)),
            "\\Recent" => Some(FlagFetch::Recent),
            _ => match Atom::try_from(f.strip_prefix('\\').unwrap().to_string()) {
                Err(_) => {
                    tracing::error!(flag = %f, "unable to encode flag as IMAP atom");
                    None
                }
                Ok(a) => Some(FlagFetch::Flag(Flag::system(a))),
            },
        },
        Some(_) => match Atom::try_from(f.to_string()) {
            Err(_) => {
                tracing::error!(flag = %f, "unable to encode flag as IMAP atom");
                None
            }
            Ok(a) => Some(FlagFetch::Flag(Flag::keyword(a))),
        },
        None => None,
    }
}

/// Wire flags → stored flag set (system bits + keywords).
pub fn to_flag_set<'a>(flags: impl IntoIterator<Item = &'a Flag<'a>>) -> FlagSet {
    let strings: Vec<String> = flags.into_iter().map(|f| f.to_string()).collect();
    FlagSet::from_strings(strings.iter().map(|s| s.as_str()))
}

/// Stored flag set → wire flags for a FETCH FLAGS item.
pub fn fetch_flags(set: &FlagSet) -> Vec<FlagFetch<'static>> {
    set.to_strings()
        .iter()
        .filter_map(|f| from_str(f))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use depeche_meta::model::flag_bits;

    #[test]
    fn wire_roundtrip() {
        let set = FlagSet {
            bits: flag_bits::SEEN | flag_bits::DELETED,
            custom: vec!["$Forwarded".into()],
        };
        let wire = fetch_flags(&set);
        assert_eq!(wire.len(), 3);
        assert!(wire.contains(&FlagFetch::Flag(Flag::Seen)));
        assert!(wire.contains(&FlagFetch::Flag(Flag::Deleted)));
    }

    #[test]
    fn recent_is_not_a_storable_flag() {
        let set = FlagSet {
            bits: flag_bits::RECENT,
            custom: vec![],
        };
        assert_eq!(fetch_flags(&set), vec![FlagFetch::Recent]);
    }
}
