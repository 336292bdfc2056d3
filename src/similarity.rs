//! src/similarity.rs
//! Odległość edycyjna + znormalizowane podobieństwo, wspólne dla duplikatów
//! wiadomości i podobnych nazw. Czyste funkcje, bez stanu.

use std::cmp::min;

use unicode_normalization::UnicodeNormalization;

/// Odległość Levenshteina po wartościach skalarnych Unicode.
/// Czas O(|a|·|b|), pamięć O(min(|a|,|b|)).
pub fn distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    // krótszy string wyznacza szerokość wiersza
    let (long, short) = if a.len() >= b.len() { (a, b) } else { (b, a) };

    if short.is_empty() {
        return long.len();
    }

    let mut prev: Vec<usize> = (0..=short.len()).collect();
    let mut curr = vec![0usize; short.len() + 1];

    for (i, cl) in long.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cs) in short.iter().enumerate() {
            let cost = if cl == cs { 0 } else { 1 };
            curr[j + 1] = min(min(curr[j] + 1, prev[j + 1] + 1), prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[short.len()]
}

/// `(max_len - distance) / max_len`, w `[0, 1]`. Dwa puste stringi są identyczne.
pub fn similarity(a: &str, b: &str) -> f64 {
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }
    let d = distance(a, b);
    (max_len - d) as f64 / max_len as f64
}

/// Normalizuje nazwę do porównań: NFKC, małe litery, mylące litery cyrylicy/greki
/// na łacinę, reszta niealfanumeryczna wylatuje.
pub fn normalize_name<S: AsRef<str>>(s: S) -> String {
    let s = s.as_ref().nfkc().collect::<String>().to_lowercase();
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch);
        } else if let Some(mapped) = map_confusable(ch) {
            out.push(mapped);
        }
    }
    out
}

/// Małe litery + zwinięte białe znaki. Dokładne duplikaty dają potem 1.0.
pub fn normalize_content(s: &str) -> String {
    s.split_whitespace()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

fn map_confusable(ch: char) -> Option<char> {
    match ch {
        // cyrylica
        '\u{0430}' => Some('a'), // а
        '\u{0435}' => Some('e'), // е
        '\u{043E}' => Some('o'), // о
        '\u{0440}' => Some('p'), // р
        '\u{0441}' => Some('c'), // с
        '\u{0445}' => Some('x'), // х
        '\u{0443}' => Some('y'), // у
        '\u{0456}' => Some('i'), // і
        '\u{0455}' => Some('s'), // ѕ
        '\u{0442}' => Some('t'), // т
        '\u{04CF}' => Some('l'), // ӏ
        // greka
        '\u{03b1}' => Some('a'), // α
        '\u{03b5}' => Some('e'), // ε
        '\u{03bf}' => Some('o'), // ο
        '\u{03c1}' => Some('p'), // ρ
        '\u{03c5}' => Some('u'), // υ
        '\u{03c7}' => Some('x'), // χ
        '\u{03ba}' => Some('k'), // κ
        '\u{03bb}' => Some('l'), // λ
        '\u{03c3}' => Some('s'), // σ
        '\u{03bd}' => Some('v'), // ν
        _ => None,
    }
}
