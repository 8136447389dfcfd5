//! Name-sorted registries with cursor pagination.
//!
//! A cursor is the standard base64 encoding of the key of the last item on the previous
//! page. The next page starts strictly after that key, so pages stay stable while the
//! registry is only appended to. A cursor that does not decode to a registered key is
//! rejected with `INVALID_PARAMS`.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::{collections::BTreeMap, ops::Bound};

use crate::{
    error::{Error, ErrorCode, Result},
    types::Cursor,
};

/// One page of a registry listing
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<Cursor>,
}

#[derive(Debug)]
pub struct Registry<T> {
    entries: BTreeMap<String, T>,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<T> Registry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace; returns the previous entry under the same key
    pub fn insert(&mut self, key: impl Into<String>, value: T) -> Option<T> {
        self.entries.insert(key.into(), value)
    }

    pub fn remove(&mut self, key: &str) -> Option<T> {
        self.entries.remove(key)
    }

    pub fn get(&self, key: &str) -> Option<&T> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in key order
    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.entries.values()
    }

    /// Up to `limit` entries after `cursor`, mapped through `f`.
    ///
    /// Without a limit (or with a limit of zero) everything after the cursor is returned.
    pub fn page<U>(
        &self,
        cursor: Option<&str>,
        limit: Option<usize>,
        f: impl Fn(&T) -> U,
    ) -> Result<Page<U>> {
        let start = match cursor {
            None => Bound::Unbounded,
            Some(cursor) => {
                let key = decode_cursor(cursor)?;
                if !self.entries.contains_key(&key) {
                    return Err(invalid_cursor(cursor));
                }
                Bound::Excluded(key)
            }
        };

        let remaining: Vec<(&String, &T)> = self
            .entries
            .range::<String, _>((start, Bound::Unbounded))
            .collect();
        let limit = limit.filter(|l| *l > 0).unwrap_or(usize::MAX);
        let take = remaining.len().min(limit);

        let next_cursor = if remaining.len() > take && take > 0 {
            Some(encode_cursor(remaining[take - 1].0))
        } else {
            None
        };
        let items = remaining[..take].iter().map(|(_, v)| f(v)).collect();
        Ok(Page { items, next_cursor })
    }
}

pub fn encode_cursor(key: &str) -> Cursor {
    STANDARD.encode(key.as_bytes())
}

pub fn decode_cursor(cursor: &str) -> Result<String> {
    let bytes = STANDARD
        .decode(cursor.as_bytes())
        .map_err(|_| invalid_cursor(cursor))?;
    String::from_utf8(bytes).map_err(|_| invalid_cursor(cursor))
}

fn invalid_cursor(cursor: &str) -> Error {
    Error::protocol(ErrorCode::InvalidParams, format!("Invalid cursor: {}", cursor))
}
