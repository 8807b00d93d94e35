//! Ordered key/value metadata records.
//!
//! Keys are not required to be unique and insertion order is preserved, since
//! the peer sees the records in the order they were sent.

use bytes::Bytes;

use crate::errors::CallError;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    entries: Vec<(Bytes, Bytes)>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds metadata from a flat `[key, value, key, value, ...]` sequence.
    pub fn from_flat<I, B>(items: I) -> Result<Self, CallError>
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        let flat: Vec<Bytes> = items.into_iter().map(Into::into).collect();
        if flat.len() % 2 != 0 {
            return Err(CallError::CallerInput(format!(
                "metadata must be an even-length key/value sequence, got {} items",
                flat.len()
            )));
        }

        let mut metadata = Self::new();
        let mut items = flat.into_iter();
        while let (Some(key), Some(value)) = (items.next(), items.next()) {
            if key.is_empty() {
                return Err(CallError::CallerInput(
                    "metadata keys must not be empty".to_string(),
                ));
            }
            metadata.entries.push((key, value));
        }
        Ok(metadata)
    }

    pub fn insert(&mut self, key: impl Into<Bytes>, value: impl Into<Bytes>) {
        self.entries.push((key.into(), value.into()));
    }

    /// First value recorded for `key`.
    pub fn get(&self, key: &[u8]) -> Option<&Bytes> {
        self.entries
            .iter()
            .find(|(candidate, _)| candidate.as_ref() == key)
            .map(|(_, value)| value)
    }

    pub fn get_all<'a>(&'a self, key: &'a [u8]) -> impl Iterator<Item = &'a Bytes> + 'a {
        self.entries
            .iter()
            .filter(move |(candidate, _)| candidate.as_ref() == key)
            .map(|(_, value)| value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Bytes, &Bytes)> {
        self.entries.iter().map(|(key, value)| (key, value))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(Bytes, Bytes)> for Metadata {
    fn from_iter<T: IntoIterator<Item = (Bytes, Bytes)>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}
