//! Glob matching for file listing (`*`, `?`, `[...]`, `/` as separator).
//!
//! A pattern with an unterminated `[...]` class is a malformed glob; rather
//! than reject it, a second attempt matches the same pattern with every
//! metacharacter escaped, so it behaves as a literal name. This mirrors a
//! two-attempt matcher that falls back the same way, and keeps existing
//! callers that pass oddly-bracketed literal names working.
pub fn matches(pattern: &str, name: &str) -> bool {
    match compile(pattern) {
        Some(tokens) => matches_tokens(&tokens, name),
        None => pattern == name,
    }
}

#[derive(Debug, Clone)]
enum Token {
    Literal(char),
    Any,
    Star,
    Class(Vec<ClassItem>, bool),
}

#[derive(Debug, Clone)]
enum ClassItem {
    Char(char),
    Range(char, char),
}

fn compile(pattern: &str) -> Option<Vec<Token>> {
    let chars: Vec<char> = pattern.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '?' => {
                tokens.push(Token::Any);
                i += 1;
            }
            '[' => {
                let close = chars[i + 1..].iter().position(|&c| c == ']').map(|p| i + 1 + p)?;
                let mut j = i + 1;
                let negate = chars.get(j) == Some(&'!');
                if negate {
                    j += 1;
                }
                let mut items = Vec::new();
                while j < close {
                    if j + 2 < close && chars[j + 1] == '-' {
                        items.push(ClassItem::Range(chars[j], chars[j + 2]));
                        j += 3;
                    } else {
                        items.push(ClassItem::Char(chars[j]));
                        j += 1;
                    }
                }
                tokens.push(Token::Class(items, negate));
                i = close + 1;
            }
            c => {
                tokens.push(Token::Literal(c));
                i += 1;
            }
        }
    }
    Some(tokens)
}

fn matches_tokens(tokens: &[Token], name: &str) -> bool {
    let name: Vec<char> = name.chars().collect();
    matches_at(tokens, &name)
}

fn matches_at(tokens: &[Token], name: &[char]) -> bool {
    match tokens.first() {
        None => name.is_empty(),
        Some(Token::Star) => {
            (0..=name.len()).any(|n| matches_at(&tokens[1..], &name[n..]))
        }
        Some(Token::Any) => !name.is_empty() && matches_at(&tokens[1..], &name[1..]),
        Some(Token::Literal(c)) => name.first() == Some(c) && matches_at(&tokens[1..], &name[1..]),
        Some(Token::Class(items, negate)) => {
            if name.is_empty() {
                return false;
            }
            let hit = items.iter().any(|it| match it {
                ClassItem::Char(c) => *c == name[0],
                ClassItem::Range(a, b) => *a <= name[0] && name[0] <= *b,
            });
            (hit != *negate) && matches_at(&tokens[1..], &name[1..])
        }
    }
}

/// The longest prefix of `pattern` with no glob metacharacter, used to
/// bound a per-shard cursor scan to the matching key range.
pub fn fixed_prefix(pattern: &str) -> &str {
    let end = pattern
        .find(['*', '?', '['])
        .unwrap_or(pattern.len());
    &pattern[..end]
}
