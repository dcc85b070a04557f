use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use ndarray::ArrayViewMut1;

use super::{LogitsProcessor, ban_tokens};

/// Index of every n-gram seen in a token history, keyed by its first
/// `n - 1` tokens.
///
/// Each entry records the start position of the occurrence and the token
/// that completed it.
#[derive(Debug, Clone)]
pub struct NGramTable {
    n: usize,
    indexed: usize,
    completions: HashMap<Vec<u32>, Vec<(usize, u32)>>,
}

impl NGramTable {
    pub fn new(n: usize) -> Self {
        Self {
            n: n.max(1),
            indexed: 0,
            completions: HashMap::new(),
        }
    }

    pub fn from_tokens(n: usize, tokens: &[u32]) -> Self {
        let mut table = Self::new(n);
        table.update(tokens);
        table
    }

    /// Indexes n-grams ending in tokens appended since the last update.
    ///
    /// `tokens` must extend the history previously passed in.
    pub fn update(&mut self, tokens: &[u32]) {
        let n = self.n;
        if tokens.len() < n {
            return;
        }
        for start in self.indexed..=tokens.len() - n {
            let (prefix, completion) = tokens[start..start + n].split_at(n - 1);
            self.completions
                .entry(prefix.to_vec())
                .or_default()
                .push((start, completion[0]));
        }
        self.indexed = tokens.len() - n + 1;
    }

    /// Tokens that would repeat an indexed n-gram if appended to `tokens`.
    pub fn banned_tokens(&self, tokens: &[u32]) -> Vec<u32> {
        if tokens.len() + 1 < self.n {
            return Vec::new();
        }
        let prefix = &tokens[tokens.len() + 1 - self.n..];
        self.completions
            .get(prefix)
            .map(|seen| seen.iter().map(|&(_, token)| token).collect())
            .unwrap_or_default()
    }

    /// Number of indexed occurrences.
    pub fn len(&self) -> usize {
        self.completions.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.completions.is_empty()
    }
}

/// Bans every token that would complete an n-gram already present in the
/// history.
///
/// Tables are kept per history for one step. A beam's table is its
/// parent's table extended by the newest token.
pub struct NoRepeatNGramLogitsProcessor {
    ngram_size: usize,
    tables: Mutex<HashMap<Vec<u32>, NGramTable>>,
}

impl NoRepeatNGramLogitsProcessor {
    pub fn new(ngram_size: usize) -> Self {
        Self {
            ngram_size,
            tables: Mutex::new(HashMap::new()),
        }
    }

    fn table_for(&self, input_ids: &[u32]) -> NGramTable {
        let mut tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
        let parent = &input_ids[..input_ids.len() - 1];
        let mut table = tables
            .get(input_ids)
            .or_else(|| tables.get(parent))
            .cloned()
            .unwrap_or_else(|| NGramTable::new(self.ngram_size));
        table.update(input_ids);

        // histories two or more tokens shorter can no longer be a parent
        tables.retain(|history, _| history.len() + 1 >= input_ids.len());
        tables.insert(input_ids.to_vec(), table.clone());
        table
    }
}

impl LogitsProcessor for NoRepeatNGramLogitsProcessor {
    fn process(&self, input_ids: &[u32], mut scores: ArrayViewMut1<'_, f32>) {
        if self.ngram_size == 0 || input_ids.len() < self.ngram_size {
            return;
        }
        let table = self.table_for(input_ids);
        ban_tokens(&mut scores, table.banned_tokens(input_ids));
    }

    fn name(&self) -> &'static str {
        "no_repeat_ngram"
    }
}
