//! Client-side revision allocation.
//!
//! Documents are written with `new_edits=false`, so the client dictates the
//! revision chain instead of letting the server mint ids.

use couchsync_common::Revisions;

/// Suffix marking revisions generated for local use only.
pub const LOCAL_SUFFIX: &str = "-local";

/// Source of fresh identifiers for documents and revisions.
pub trait IdGenerator: Send + Sync {
    /// Return a new unique identifier.
    fn generate(&self) -> String;
}

/// UUID v4 based identifiers.
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidGenerator;

impl IdGenerator for UuidGenerator {
    fn generate(&self) -> String {
        uuid::Uuid::new_v4().simple().to_string()
    }
}

/// A newly allocated revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Revision {
    /// Revision string, `<start>-<id>[-local]`.
    pub rev: String,
    /// Full chain including the new id.
    pub revisions: Revisions,
}

/// Split a revision string into its generation and hash.
///
/// The `-local` suffix is not part of the hash.
pub fn parse_rev(rev: &str) -> Option<(u64, &str)> {
    let (start, hash) = rev.split_once('-')?;
    let start = start.parse().ok()?;
    Some((start, hash.strip_suffix(LOCAL_SUFFIX).unwrap_or(hash)))
}

/// Compute the revision following `previous_rev`.
///
/// The previous chain is taken from `previous_revisions` when known,
/// otherwise from the hash of `previous_rev`.
pub fn next_revision(
    previous_rev: Option<&str>,
    previous_revisions: Option<&Revisions>,
    local_only: bool,
    new_id: &str,
) -> Revision {
    let parsed = previous_rev.and_then(parse_rev);
    let previous_start = parsed.map(|(start, _)| start).unwrap_or(0);

    let previous_ids = match (previous_revisions, parsed) {
        (Some(revisions), _) => revisions.ids.clone(),
        (None, Some((_, hash))) => vec![hash.to_string()],
        (None, None) => Vec::new(),
    };

    let start = previous_start + 1;
    let mut ids = Vec::with_capacity(previous_ids.len() + 1);
    ids.push(new_id.to_string());
    ids.extend(previous_ids);

    let mut rev = format!("{}-{}", start, new_id);
    if local_only {
        rev.push_str(LOCAL_SUFFIX);
    }

    Revision {
        rev,
        revisions: Revisions { start, ids },
    }
}
