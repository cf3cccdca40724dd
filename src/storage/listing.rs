//! Delimiter and `max_keys` emulation for backends that can only produce a
//! flat recursive listing.

use std::collections::BTreeSet;

use super::{ListOptions, ListResult, StorageObject};

enum Entry {
    Object(StorageObject),
    Prefix(String),
}

impl Entry {
    fn sort_key(&self) -> &str {
        match self {
            Entry::Object(o) => &o.key,
            Entry::Prefix(p) => p,
        }
    }
}

/// Fold a flat set of objects into a [`ListResult`] honouring the prefix,
/// delimiter and `max_keys` of `opts`.
///
/// Objects and common prefixes are merged in lexicographic order before
/// truncation, so `max_keys` bounds their combined count the same way S3
/// does.
pub fn fold_listing<I>(objects: I, opts: &ListOptions) -> ListResult
where
    I: IntoIterator<Item = StorageObject>,
{
    fold_entries(objects, std::iter::empty(), opts)
}

/// Like [`fold_listing`] but also merges folder prefixes discovered by
/// backends that walk real directories (each ending in `/`).
pub fn fold_entries<I, P>(objects: I, folders: P, opts: &ListOptions) -> ListResult
where
    I: IntoIterator<Item = StorageObject>,
    P: IntoIterator<Item = String>,
{
    let mut files = Vec::new();
    let mut prefixes = BTreeSet::new();

    for folder in folders {
        let Some(rest) = folder.strip_prefix(opts.prefix.as_str()) else {
            continue;
        };
        // Recursive listings only report objects.
        if let Some(end) = opts.delimiter().and_then(|d| rest.find(d).map(|idx| idx + d.len())) {
            prefixes.insert(format!("{}{}", opts.prefix, &rest[..end]));
        }
    }

    for object in objects {
        let Some(rest) = object.key.strip_prefix(opts.prefix.as_str()) else {
            continue;
        };
        match opts.delimiter().and_then(|d| rest.find(d).map(|idx| idx + d.len())) {
            Some(end) => {
                prefixes.insert(format!("{}{}", opts.prefix, &rest[..end]));
            }
            None => files.push(object),
        }
    }

    let mut entries: Vec<Entry> = files
        .into_iter()
        .map(Entry::Object)
        .chain(prefixes.into_iter().map(Entry::Prefix))
        .collect();
    entries.sort_by(|a, b| a.sort_key().cmp(b.sort_key()));

    let mut is_truncated = false;
    if let Some(max) = opts.max_keys {
        if entries.len() > max {
            entries.truncate(max);
            is_truncated = true;
        }
    }

    let mut result = ListResult {
        is_truncated,
        ..ListResult::default()
    };
    for entry in entries {
        match entry {
            Entry::Object(o) => result.objects.push(o),
            Entry::Prefix(p) => result.prefixes.push(p),
        }
    }
    result
}
