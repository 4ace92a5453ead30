//! Human-exchangeable identifiers: an id written as base-W digits, most
//! significant first, each digit replaced by its word in a W-word list.

use bip39::Language;

#[derive(Debug, Clone, Copy)]
pub struct Dictionary {
    words: &'static [&'static str],
}

impl Dictionary {
    /// # Panics
    /// Panics if the list has fewer than two words.
    pub fn new(words: &'static [&'static str]) -> Self {
        assert!(words.len() >= 2, "word list needs at least two entries");
        Self { words }
    }

    /// The 2048-word BIP-39 English list.
    pub fn english() -> Self {
        Self::new(Language::English.word_list())
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Word digits of `id`. Zero is a single word.
    pub fn encode(&self, id: u64) -> Vec<&'static str> {
        let base = self.words.len() as u64;
        let mut digits = Vec::new();
        let mut v = id;
        loop {
            digits.push(self.words[(v % base) as usize]);
            v /= base;
            if v == 0 {
                break;
            }
        }
        digits.reverse();
        digits
    }

    /// Words of `id` joined by single spaces.
    pub fn render(&self, id: u64) -> String {
        self.encode(id).join(" ")
    }

    /// Parse whitespace-separated words, ignoring case. `None` if the input
    /// is empty, holds a word outside the list, or overflows.
    pub fn decode(&self, input: &str) -> Option<u64> {
        let base = self.words.len() as u64;
        let mut id: u64 = 0;
        let mut seen = false;
        for word in input.split_whitespace() {
            let digit = self.position(word)?;
            id = id.checked_mul(base)?.checked_add(digit)?;
            seen = true;
        }
        seen.then_some(id)
    }

    fn position(&self, word: &str) -> Option<u64> {
        self.words
            .iter()
            .position(|w| w.eq_ignore_ascii_case(word))
            .map(|i| i as u64)
    }
}

impl Default for Dictionary {
    fn default() -> Self {
        Self::english()
    }
}
