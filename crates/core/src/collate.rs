//! Casefolding and collation keys
//!
//! String values are compared in three modes; the casefold and collate modes
//! compare derived keys rather than the raw bytes. Keys are plain strings so
//! a byte comparison of two keys yields the intended order:
//!
//! - the casefold key is the Unicode lowercase fold of the string;
//! - the collation key folds case and encodes digit runs with a
//!   length prefix so embedded numbers order numerically
//!   (`"track 2" < "track 10"`), with the raw string as a final tie-break.

/// Digit-run marker in collation keys. Sorts below any printable character.
const NUM_MARK: char = '\u{1}';

/// Separator between the folded body and the raw tie-break suffix.
const TIE_MARK: char = '\u{2}';

/// Returns the casefolded version of `s`.
pub fn casefold(s: &str) -> String {
    s.to_lowercase()
}

/// Returns the collation key of `s`.
///
/// Keys compare case-insensitively, digit runs compare by numeric value, and
/// strings equal under both rules fall back to raw byte order so the result
/// is a total order.
pub fn collate_key(s: &str) -> String {
    let folded = casefold(s);
    let mut key = String::with_capacity(folded.len() + s.len() + 1);

    let bytes = folded.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i].is_ascii_digit() {
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            push_digit_run(&mut key, &folded[start..i]);
        } else {
            let start = i;
            while i < bytes.len() && !bytes[i].is_ascii_digit() {
                i += 1;
            }
            key.push_str(&folded[start..i]);
        }
    }

    key.push(TIE_MARK);
    key.push_str(s);
    key
}

/// Encodes one maximal digit run. Leading zeros are stripped first, then the
/// run is emitted as marker + eight-digit hex length + digits, so a shorter
/// number always orders before a longer one.
fn push_digit_run(key: &mut String, run: &str) {
    let stripped = run.trim_start_matches('0');
    let digits = if stripped.is_empty() { "0" } else { stripped };

    key.push(NUM_MARK);
    key.push_str(&format!("{:08x}", digits.len()));
    key.push_str(digits);
}
