//! Sortable, prefixed identifiers (`conn_01J...`).

use ulid::Ulid;

pub mod prefix {
    pub const CONNECTION: &str = "conn";
}

/// `<prefix>_<ulid>`; ids minted later sort after earlier ones.
pub fn prefixed_ulid(prefix: &str) -> String {
    format!("{prefix}_{}", Ulid::new())
}

/// Split an id minted by [`prefixed_ulid`] back into its ULID, provided the
/// prefix matches.
pub fn parse_prefixed(id: &str, prefix: &str) -> Option<Ulid> {
    let rest = id.strip_prefix(prefix)?.strip_prefix('_')?;
    Ulid::from_string(rest).ok()
}

/// Types whose instances are named by a prefixed ULID.
pub trait PrefixedId {
    const PREFIX: &'static str;

    fn generate() -> String {
        prefixed_ulid(Self::PREFIX)
    }
}
