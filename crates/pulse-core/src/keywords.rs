//! Keyword sanitizing and quota-bounded batching for the trends source.

use std::slice::Chunks;

/// Keep word characters and whitespace only, collapsing runs of whitespace.
/// Returns `None` when nothing survives.
pub fn sanitize_keyword(raw: &str) -> Option<String> {
    let kept: String = raw
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '_' || c.is_whitespace() {
                c
            } else {
                ' '
            }
        })
        .collect();
    let collapsed = kept.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

/// Sanitized keywords split into contiguous chunks of at most `size`.
///
/// [`KeywordBatcher::batches`] is lazy and can be called any number of times;
/// each call starts again from the first batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeywordBatcher {
    keywords: Vec<String>,
    size: usize,
}

impl KeywordBatcher {
    pub fn new<I, S>(keywords: I, size: usize) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            keywords: keywords
                .into_iter()
                .filter_map(|k| sanitize_keyword(k.as_ref()))
                .collect(),
            size: size.max(1),
        }
    }

    pub fn keywords(&self) -> &[String] {
        &self.keywords
    }

    pub fn batch_size(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.keywords.is_empty()
    }

    pub fn batch_count(&self) -> usize {
        self.keywords.len().div_ceil(self.size)
    }

    pub fn batches(&self) -> Chunks<'_, String> {
        self.keywords.chunks(self.size)
    }
}

impl<'a> IntoIterator for &'a KeywordBatcher {
    type Item = &'a [String];
    type IntoIter = Chunks<'a, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.batches()
    }
}

/// Owned convenience form of [`KeywordBatcher`].
pub fn batch<S: AsRef<str>>(keywords: &[S], size: usize) -> Vec<Vec<String>> {
    KeywordBatcher::new(keywords, size)
        .batches()
        .map(<[String]>::to_vec)
        .collect()
}
