//! Mangled primary keys and the limit-window sort order.
//!
//! A primary key (plus, for secondary-index-originated rows, a tag disambiguating
//! duplicate index values) is escape-encoded into an opaque string that preserves the
//! source comparator's order and can be used as a map key on the wire.

use std::cmp::Ordering;

use crate::datum::{self, Datum};

/// Escape byte. Bytes 0 (NUL, unsupported in places downstream), 1 (our own
/// delimiter) and 2 (this escape byte) are escaped as `[2, byte + 2]`.
const ESCAPE: u8 = 2;
/// Delimiter between the escaped primary key and the optional tag.
const DELIM: u8 = 1;

/// Whether a row's mangled key is being produced from a primary-index read (no tag)
/// or a secondary-index read (tag disambiguates ties on the index value).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsPrimary {
    Yes,
    No,
}

/// Encodes a raw primary-key byte string (and, for secondary-index rows, a tag
/// counter disambiguating duplicate index values) into the mangled form.
///
/// The encoding is order-preserving: for two primary keys `a < b` (byte-wise),
/// `mangle(a, is_primary, _) < mangle(b, is_primary, _)` as plain byte-string
/// comparison, because the delimiter (1) sorts before any escaped continuation and
/// the escape scheme never reorders the payload bytes it passes through unescaped.
pub fn mangle(raw_key: &[u8], is_primary: IsPrimary, tag: Option<u64>) -> String {
    let mut s = Vec::with_capacity(raw_key.len() + 2);
    for &b in raw_key {
        if b == 0 || b == DELIM || b == ESCAPE {
            s.push(ESCAPE);
            s.push(b + 2);
        } else {
            s.push(b);
        }
    }
    s.push(DELIM);
    if is_primary == IsPrimary::No {
        if let Some(tag) = tag {
            s.extend(format!("{tag:016x}").into_bytes());
        }
    }
    // The encoding only ever produces valid UTF-8 (escaped bytes land in the ASCII
    // control range plus the hex tag), so this is lossless.
    String::from_utf8(s).expect("mangled key is always valid utf8")
}

/// Inverse of [`mangle`]: splits a mangled key back into its raw primary-key bytes
/// and, if present, the decoded tag.
pub fn unmangle(mangled: &str) -> crate::Result<(Vec<u8>, Option<u64>)> {
    let bytes = mangled.as_bytes();
    let mut raw = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            DELIM => {
                let tag_bytes = &bytes[i + 1..];
                let tag = if tag_bytes.is_empty() {
                    None
                } else {
                    let s = std::str::from_utf8(tag_bytes).map_err(|_| {
                        crate::Error::BadMangledKey("non-utf8 tag".to_string())
                    })?;
                    Some(u64::from_str_radix(s, 16).map_err(|_| {
                        crate::Error::BadMangledKey(format!("bad tag hex: {s}"))
                    })?)
                };
                return Ok((raw, tag));
            }
            ESCAPE => {
                let escaped = *bytes.get(i + 1).ok_or_else(|| {
                    crate::Error::BadMangledKey("truncated escape sequence".to_string())
                })?;
                raw.push(escaped - 2);
                i += 2;
            }
            b => {
                raw.push(b);
                i += 1;
            }
        }
    }
    Err(crate::Error::BadMangledKey(
        "missing delimiter byte".to_string(),
    ))
}

/// Ascending or descending limit-subscription sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sorting {
    Ascending,
    Descending,
}

impl Sorting {
    pub fn flip(self) -> Sorting {
        match self {
            Sorting::Ascending => Sorting::Descending,
            Sorting::Descending => Sorting::Ascending,
        }
    }
}

/// A row's position in a limit window: `(sindex_value, mangled_primary)`. For
/// primary-keyed limits `sindex_value` is always `Datum::Null` and the ordering
/// reduces to the mangled primary key.
pub type SortKey = (Datum, String);

/// Comparator for limit windows. `Ordering::Less` here means "should be evicted
/// first" (this is the *reversed* comparator relative to the subscription's
/// declared sort direction), so that a window sorted by this order keeps its
/// "worst" element at the front and `truncate_top` can simply drop a prefix.
#[derive(Debug, Clone, Copy)]
pub struct LimitOrder {
    sorting: Sorting,
}

impl LimitOrder {
    pub fn new(sorting: Sorting) -> Self {
        LimitOrder { sorting }
    }

    pub fn sorting(&self) -> Sorting {
        self.sorting
    }

    /// Orders two `(sindex_value, mangled_primary)` pairs for eviction purposes: the
    /// element ordered first by this comparator is the one `truncate_top` drops
    /// first.
    pub fn cmp_sort_keys(&self, a: &SortKey, b: &SortKey) -> Ordering {
        let value_cmp = datum::cmp(&a.0, &b.0);
        let primary_cmp = || match self.sorting {
            Sorting::Ascending => a.1.cmp(&b.1),
            Sorting::Descending => b.1.cmp(&a.1),
        };
        match self.sorting {
            Sorting::Ascending => match value_cmp {
                Ordering::Equal => primary_cmp(),
                other => other.reverse(),
            },
            Sorting::Descending => match value_cmp {
                Ordering::Equal => primary_cmp(),
                other => other,
            },
        }
    }
}
