//! Glob-like patterns
//!
//! Patterns consist of normal characters and the special characters `?` and
//! `*`: `?` matches any one byte, `*` matches any run of bytes, possibly
//! empty. A pattern made only of digits, `?` and `*` (optionally prefixed by
//! `-`) additionally matches integer values digit-wise, so `"19*"` matches
//! every year in the 1900s.
//!
//! A pattern is compiled once into star-free chunks and matched by anchoring
//! the first chunk at the start, searching middle chunks left to right, and
//! anchoring the final chunk at the end.

use crate::collate;
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq)]
enum PatByte {
    /// `?`: matches any single byte
    Any,
    /// A literal byte
    Byte(u8),
}

/// A star-free sub-pattern.
#[derive(Debug, Clone, Default)]
struct Chunk(Vec<PatByte>);

impl Chunk {
    fn len(&self) -> usize {
        self.0.len()
    }

    /// Matches this chunk against the head of `s`. `s` must be long enough.
    fn matches_at(&self, s: &[u8]) -> bool {
        self.0
            .iter()
            .zip(s)
            .all(|(p, b)| matches!(p, PatByte::Any) || *p == PatByte::Byte(*b))
    }

    /// First offset in `s` where this chunk matches.
    fn find_in(&self, s: &[u8]) -> Option<usize> {
        if self.len() > s.len() {
            return None;
        }
        (0..=s.len() - self.len()).find(|&i| self.matches_at(&s[i..]))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum NumDigit {
    Any,
    Digit(u8),
}

/// A star-free digit sub-pattern, stored least-significant digit first so it
/// can be peeled off an integer with `% 10` / `/ 10`.
#[derive(Debug, Clone)]
struct NumChunk(Vec<NumDigit>);

impl NumChunk {
    fn len(&self) -> usize {
        self.0.len()
    }

    /// Matches the `len()` low digits of `num`. Returns the remaining high
    /// digits on success, `None` when `num` is too small or a digit differs.
    fn match_low(&self, mut num: i64) -> Option<i64> {
        if num < pow10(self.len().saturating_sub(1)) && self.len() > 1 {
            return None;
        }
        for d in &self.0 {
            if let NumDigit::Digit(want) = d {
                if i64::from(*want) != num % 10 {
                    return None;
                }
            }
            num /= 10;
        }
        Some(num)
    }

    /// Searches for this chunk anywhere in `num`, dropping low digits until
    /// it matches. Returns the digits above the match.
    fn find_low(&self, mut num: i64) -> Option<i64> {
        loop {
            match self.match_low(num) {
                Some(rest) => return Some(rest),
                None if num == 0 => return None,
                None => num /= 10,
            }
        }
    }
}

/// A compiled pattern usable against both string and integer values.
#[derive(Debug, Clone)]
pub struct Pattern {
    casefold: bool,
    str_chunks: Vec<Chunk>,
    /// Digit chunks for non-negative integers, last sub-pattern first.
    pos_chunks: Option<Vec<NumChunk>>,
    /// Digit chunks matched against the magnitude of negative integers.
    neg_chunks: Option<Vec<NumChunk>>,
}

impl Pattern {
    /// Compiles `pattern`. With `casefold` set, string matching is Unicode
    /// case-insensitive.
    pub fn new(pattern: &str, casefold: bool) -> Pattern {
        let str_chunks = build_str_chunks(pattern, casefold);

        let (pos_chunks, neg_chunks) = if is_num_pattern(pattern) {
            let pos = if !pattern.starts_with('-') {
                Some(build_num_chunks(pattern))
            } else {
                None
            };
            // A leading '-' or a '?' that could stand for it strips one
            // character; a leading '*' may swallow the sign on its own.
            let neg = if pattern.starts_with('-') || pattern.starts_with('?') {
                Some(build_num_chunks(&pattern[1..]))
            } else if pattern.starts_with('*') {
                Some(build_num_chunks(pattern))
            } else {
                None
            };
            (pos, neg)
        } else {
            (None, None)
        };

        Pattern {
            casefold,
            str_chunks,
            pos_chunks,
            neg_chunks,
        }
    }

    /// Matches the pattern against a value.
    pub fn matches(&self, value: &Value) -> bool {
        match value {
            Value::Str(s) => {
                let hay = if self.casefold { s.casefolded() } else { s.as_str() };
                self.matches_str_raw(hay)
            }
            Value::Int(i) => {
                if *i >= 0 {
                    match &self.pos_chunks {
                        Some(chunks) => num_match(chunks, i64::from(*i)),
                        None => false,
                    }
                } else {
                    match &self.neg_chunks {
                        Some(chunks) => num_match(chunks, -i64::from(*i)),
                        None => false,
                    }
                }
            }
        }
    }

    /// Matches the pattern against a plain string, casefolding it first when
    /// the pattern was built with `casefold`.
    pub fn matches_str(&self, s: &str) -> bool {
        if self.casefold {
            self.matches_str_raw(&collate::casefold(s))
        } else {
            self.matches_str_raw(s)
        }
    }

    fn matches_str_raw(&self, hay: &str) -> bool {
        str_match(&self.str_chunks, hay.as_bytes())
    }
}

/// Splits `pattern` on `*` (collapsing runs) into literal chunks, replacing
/// `?` with a wildcard byte. Literal stretches are casefolded per stretch so
/// multi-byte folds never straddle a wildcard.
fn build_str_chunks(pattern: &str, casefold: bool) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    let mut cur = Chunk::default();
    let mut buf = String::new();
    let mut prev_star = false;

    let mut flush = |cur: &mut Chunk, buf: &mut String| {
        if buf.is_empty() {
            return;
        }
        if casefold {
            cur.0.extend(collate::casefold(buf).bytes().map(PatByte::Byte));
        } else {
            cur.0.extend(buf.bytes().map(PatByte::Byte));
        }
        buf.clear();
    };

    for c in pattern.chars() {
        match c {
            '?' => {
                flush(&mut cur, &mut buf);
                cur.0.push(PatByte::Any);
                prev_star = false;
            }
            '*' => {
                if !prev_star {
                    flush(&mut cur, &mut buf);
                    chunks.push(std::mem::take(&mut cur));
                    prev_star = true;
                }
            }
            _ => {
                buf.push(c);
                prev_star = false;
            }
        }
    }
    flush(&mut cur, &mut buf);
    chunks.push(cur);

    chunks
}

/// Matches chunk list against `s`: first chunk anchored at the start, middle
/// chunks searched in order, last chunk anchored at the end.
fn str_match(chunks: &[Chunk], s: &[u8]) -> bool {
    let mut first = true;
    let mut i = 0usize;
    let mut ci = 0usize;

    while ci + 1 < chunks.len() && i < s.len() {
        let chunk = &chunks[ci];
        if first {
            if chunk.len() > s.len() || !chunk.matches_at(s) {
                return false;
            }
            i = chunk.len();
            first = false;
        } else {
            match chunk.find_in(&s[i..]) {
                Some(j) => i += j + chunk.len(),
                None => return false,
            }
        }
        ci += 1;
    }

    let tail = &chunks[ci];
    if first {
        tail.len() == s.len() && tail.matches_at(s)
    } else if tail.len() <= s.len() - i {
        tail.matches_at(&s[s.len() - tail.len()..])
    } else {
        false
    }
}

/// A numeric pattern consists only of digits, `?` and `*`, optionally
/// prefixed by `-`.
fn is_num_pattern(pattern: &str) -> bool {
    let body = pattern.strip_prefix('-').unwrap_or(pattern);
    body.chars().all(|c| c.is_ascii_digit() || c == '?' || c == '*')
}

/// Splits a numeric pattern on `*` into digit chunks, ordered last
/// sub-pattern first with digits reversed, so matching consumes the integer
/// from its least significant end.
fn build_num_chunks(pattern: &str) -> Vec<NumChunk> {
    let mut collapsed = String::with_capacity(pattern.len());
    for c in pattern.chars() {
        if c == '*' && collapsed.ends_with('*') {
            continue;
        }
        collapsed.push(c);
    }

    collapsed
        .split('*')
        .rev()
        .map(|seg| {
            NumChunk(
                seg.chars()
                    .rev()
                    .map(|c| {
                        if c == '?' {
                            NumDigit::Any
                        } else {
                            NumDigit::Digit(c as u8 - b'0')
                        }
                    })
                    .collect(),
            )
        })
        .collect()
}

fn num_match(chunks: &[NumChunk], num: i64) -> bool {
    let mut first = true;
    let mut num = num;

    let (last, init) = match chunks.split_last() {
        Some(split) => split,
        None => return false,
    };

    for chunk in init {
        let rest = if first {
            first = false;
            chunk.match_low(num)
        } else {
            chunk.find_low(num)
        };
        num = match rest {
            Some(rest) => rest,
            None => return false,
        };
    }

    if first {
        // A single chunk must consume the whole number.
        last.match_low(num) == Some(0)
    } else if last.len() > 0 {
        // Keep only the top `len` digits, then require an exact match.
        let limit = pow10(last.len());
        while num >= limit {
            num /= 10;
        }
        last.match_low(num) == Some(0)
    } else {
        true
    }
}

fn pow10(exp: usize) -> i64 {
    10i64.checked_pow(exp.min(18) as u32).unwrap_or(i64::MAX)
}
