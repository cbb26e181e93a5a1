//! Phrase normalization and matching.
//!
//! Recognizers disagree on casing and punctuation ("Hey, model." vs
//! "hey model"), so matching works on normalized word tokens while every
//! token keeps its byte span in the raw text. That lets the capture machine
//! cut raw fragments at phrase boundaries without ever submitting the
//! normalized form downstream.

/// Characters trimmed from the edges of a raw fragment after cutting.
const EDGE_PUNCTUATION: &[char] = &[',', ':', ';', '.', '!', '?', '-', ' ', '\u{2014}'];

/// One word of a raw utterance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    /// Byte offset of the first character in the raw text.
    pub start: usize,
    /// Byte offset one past the last character in the raw text.
    pub end: usize,
    /// Lowercased word with apostrophes removed.
    pub norm: String,
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '\'' || c == '\u{2019}'
}

/// Split raw text into word tokens. Runs of letters, digits and apostrophes
/// form a word; everything else separates words. Tokens that contain no
/// letters or digits are dropped.
#[must_use]
pub fn tokenize(raw: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut current: Option<(usize, String)> = None;

    for (idx, c) in raw.char_indices() {
        if is_word_char(c) {
            let (_, norm) = current.get_or_insert_with(|| (idx, String::new()));
            if c.is_alphanumeric() {
                norm.extend(c.to_lowercase());
            }
        } else if let Some((start, norm)) = current.take()
            && !norm.is_empty()
        {
            tokens.push(Token {
                start,
                end: idx,
                norm,
            });
        }
    }
    if let Some((start, norm)) = current
        && !norm.is_empty()
    {
        tokens.push(Token {
            start,
            end: raw.len(),
            norm,
        });
    }
    tokens
}

/// Lowercase, strip punctuation and collapse whitespace.
///
/// `"Hey,  Model!"` → `"hey model"`, `"That's it."` → `"thats it"`.
#[must_use]
pub fn normalize(raw: &str) -> String {
    tokenize(raw)
        .into_iter()
        .map(|t| t.norm)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Raw text following the first `consumed` tokens, trimmed.
#[must_use]
pub fn text_after(raw: &str, tokens: &[Token], consumed: usize) -> String {
    match tokens.get(consumed) {
        Some(tok) => raw[tok.start..]
            .trim_start_matches(EDGE_PUNCTUATION)
            .trim()
            .to_owned(),
        None => String::new(),
    }
}

/// Raw text preceding token `index`, trimmed of trailing punctuation.
#[must_use]
pub fn text_before(raw: &str, tokens: &[Token], index: usize) -> String {
    let end = tokens.get(index).map_or(raw.len(), |t| t.start);
    raw[..end].trim_end_matches(EDGE_PUNCTUATION).trim().to_owned()
}

/// A configurable set of phrase spellings, stored as normalized token lists.
#[derive(Debug, Clone, Default)]
pub struct PhraseTable {
    variants: Vec<Vec<String>>,
}

impl PhraseTable {
    /// Build a table from raw spellings. Duplicates after normalization and
    /// empty entries are dropped; longer variants are tried first.
    #[must_use]
    pub fn new<S: AsRef<str>>(phrases: &[S]) -> Self {
        let mut variants: Vec<Vec<String>> = phrases
            .iter()
            .map(|p| tokenize(p.as_ref()).into_iter().map(|t| t.norm).collect())
            .filter(|v: &Vec<String>| !v.is_empty())
            .collect();
        variants.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        variants.dedup();
        Self { variants }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.variants.is_empty()
    }

    /// Whether the words equal one variant exactly.
    #[must_use]
    pub fn matches_exact(&self, words: &[&str]) -> bool {
        self.variants.iter().any(|v| v.len() == words.len() && starts_with(words, v))
    }

    /// Number of leading words consumed by a variant, if the words start
    /// with one.
    #[must_use]
    pub fn match_prefix(&self, words: &[&str]) -> Option<usize> {
        self.variants
            .iter()
            .find(|v| starts_with(words, v))
            .map(Vec::len)
    }

    /// Index of the first word of a variant the words end with.
    #[must_use]
    pub fn match_suffix(&self, words: &[&str]) -> Option<usize> {
        self.variants.iter().find_map(|v| {
            let start = words.len().checked_sub(v.len())?;
            starts_with(&words[start..], v).then_some(start)
        })
    }
}

fn starts_with(words: &[&str], variant: &[String]) -> bool {
    words.len() >= variant.len() && variant.iter().zip(words).all(|(v, w)| v == w)
}

/// Borrow the normalized words of a token list.
#[must_use]
pub fn words(tokens: &[Token]) -> Vec<&str> {
    tokens.iter().map(|t| t.norm.as_str()).collect()
}
