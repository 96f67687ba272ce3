//! Multi-statement splitter for the admin SQL executor.
//!
//! Splits on `;` while honoring single/double quotes, dollar-quoted bodies,
//! and line/block comments, so function definitions and string literals pass
//! through intact.

/// Splits `input` into individual statements, trimmed, empty ones dropped.
pub fn split_statements(input: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let bytes: Vec<char> = input.chars().collect();
    let mut i = 0;

    #[derive(PartialEq)]
    enum Mode {
        Plain,
        SingleQuote,
        DoubleQuote,
        LineComment,
        BlockComment,
        Dollar(String),
    }
    let mut mode = Mode::Plain;

    while i < bytes.len() {
        let c = bytes[i];
        let next = bytes.get(i + 1).copied();

        match &mode {
            Mode::Plain => match c {
                ';' => {
                    push_statement(&mut statements, &mut current);
                    i += 1;
                    continue;
                }
                '\'' => {
                    mode = Mode::SingleQuote;
                }
                '"' => {
                    mode = Mode::DoubleQuote;
                }
                '-' if next == Some('-') => {
                    mode = Mode::LineComment;
                }
                '/' if next == Some('*') => {
                    mode = Mode::BlockComment;
                }
                '$' => {
                    if let Some(tag) = dollar_tag(&bytes[i..]) {
                        current.push_str(&tag);
                        i += tag.len();
                        mode = Mode::Dollar(tag);
                        continue;
                    }
                }
                _ => {}
            },
            Mode::SingleQuote => {
                if c == '\'' {
                    // Doubled quote stays inside the literal.
                    if next == Some('\'') {
                        current.push(c);
                        current.push('\'');
                        i += 2;
                        continue;
                    }
                    mode = Mode::Plain;
                }
            }
            Mode::DoubleQuote => {
                if c == '"' {
                    mode = Mode::Plain;
                }
            }
            Mode::LineComment => {
                if c == '\n' {
                    mode = Mode::Plain;
                }
            }
            Mode::BlockComment => {
                if c == '*' && next == Some('/') {
                    current.push(c);
                    current.push('/');
                    i += 2;
                    mode = Mode::Plain;
                    continue;
                }
            }
            Mode::Dollar(tag) => {
                if input_has_tag(&bytes[i..], tag) {
                    current.push_str(tag);
                    i += tag.len();
                    mode = Mode::Plain;
                    continue;
                }
            }
        }

        current.push(c);
        i += 1;
    }

    push_statement(&mut statements, &mut current);
    statements
}

fn push_statement(statements: &mut Vec<String>, current: &mut String) {
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        statements.push(trimmed.to_owned());
    }
    current.clear();
}

/// Reads a `$tag$` opener starting at `chars[0] == '$'`.
fn dollar_tag(chars: &[char]) -> Option<String> {
    let mut tag = String::from('$');
    for &c in &chars[1..] {
        if c == '$' {
            tag.push('$');
            return Some(tag);
        }
        if c.is_ascii_alphanumeric() || c == '_' {
            tag.push(c);
        } else {
            return None;
        }
    }
    None
}

fn input_has_tag(chars: &[char], tag: &str) -> bool {
    let tag_chars: Vec<char> = tag.chars().collect();
    chars.len() >= tag_chars.len() && chars[..tag_chars.len()] == tag_chars[..]
}
