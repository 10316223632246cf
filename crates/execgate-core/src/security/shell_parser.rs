//! Shell tokenizer for safety analysis.
//!
//! Understands quoting, escapes, `&&`, `||`, `;`, `|` and `( … )` groups.
//! Anything it cannot reason about statically (substitution, redirection,
//! background jobs, multi-line input) is rejected with a reason.

use crate::error::SanitizeError;

const SUBSTITUTION: &str = "Command contains command substitution";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    And,
    Or,
    Sequence,
    Pipe,
}

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::And => "&&",
            Self::Or => "||",
            Self::Sequence => ";",
            Self::Pipe => "|",
        }
    }
}

/// One shell word: its source text and its value after quote removal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Word {
    pub raw: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Word(Word),
    Operator(Operator),
    OpenGroup,
    CloseGroup,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedCommand {
    tokens: Vec<Token>,
}

impl ParsedCommand {
    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    /// Maximal runs of words, in order. The first word of each is the
    /// executable token.
    pub fn segments(&self) -> Vec<Vec<&Word>> {
        let mut segments: Vec<Vec<&Word>> = Vec::new();
        let mut in_segment = false;
        for token in &self.tokens {
            match token {
                Token::Word(word) => {
                    if !in_segment {
                        segments.push(Vec::new());
                        in_segment = true;
                    }
                    if let Some(current) = segments.last_mut() {
                        current.push(word);
                    }
                }
                _ => in_segment = false,
            }
        }
        segments
    }
}

pub fn parse(command: &str) -> Result<ParsedCommand, String> {
    if command.contains('\n') || command.contains('\r') {
        return Err("Command contains newlines".to_string());
    }

    let mut tokens = Vec::new();
    let mut word: Option<Word> = None;
    let mut chars = command.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            ' ' | '\t' => flush(&mut word, &mut tokens),
            '\'' => {
                let current = word.get_or_insert_with(Word::default);
                current.raw.push('\'');
                loop {
                    match chars.next() {
                        Some('\'') => {
                            current.raw.push('\'');
                            break;
                        }
                        Some(ch) => {
                            current.raw.push(ch);
                            current.value.push(ch);
                        }
                        None => return Err("Unterminated single quote".to_string()),
                    }
                }
            }
            '"' => {
                let current = word.get_or_insert_with(Word::default);
                current.raw.push('"');
                loop {
                    match chars.next() {
                        Some('"') => {
                            current.raw.push('"');
                            break;
                        }
                        Some('\\') => {
                            let Some(next) = chars.next() else {
                                return Err("Unterminated double quote".to_string());
                            };
                            current.raw.push('\\');
                            current.raw.push(next);
                            if !matches!(next, '$' | '`' | '"' | '\\') {
                                current.value.push('\\');
                            }
                            current.value.push(next);
                        }
                        // Backticks expand even inside double quotes
                        Some('`') => return Err(SUBSTITUTION.to_string()),
                        Some('$') if chars.peek() == Some(&'(') => {
                            return Err(SUBSTITUTION.to_string());
                        }
                        Some(ch) => {
                            current.raw.push(ch);
                            current.value.push(ch);
                        }
                        None => return Err("Unterminated double quote".to_string()),
                    }
                }
            }
            '\\' => {
                let Some(next) = chars.next() else {
                    return Err("Command ends with a dangling escape".to_string());
                };
                let current = word.get_or_insert_with(Word::default);
                current.raw.push('\\');
                current.raw.push(next);
                current.value.push(next);
            }
            '`' => return Err(SUBSTITUTION.to_string()),
            '$' if chars.peek() == Some(&'(') => return Err(SUBSTITUTION.to_string()),
            '>' | '<' => return Err("Command contains redirection".to_string()),
            '&' => {
                if chars.peek() != Some(&'&') {
                    return Err("Command contains background operator".to_string());
                }
                chars.next();
                flush(&mut word, &mut tokens);
                tokens.push(Token::Operator(Operator::And));
            }
            '|' => {
                flush(&mut word, &mut tokens);
                match chars.peek() {
                    Some('|') => {
                        chars.next();
                        tokens.push(Token::Operator(Operator::Or));
                    }
                    Some('&') => return Err("Command contains redirection".to_string()),
                    _ => tokens.push(Token::Operator(Operator::Pipe)),
                }
            }
            ';' => {
                flush(&mut word, &mut tokens);
                tokens.push(Token::Operator(Operator::Sequence));
            }
            '(' => {
                flush(&mut word, &mut tokens);
                tokens.push(Token::OpenGroup);
            }
            ')' => {
                flush(&mut word, &mut tokens);
                tokens.push(Token::CloseGroup);
            }
            _ => {
                let current = word.get_or_insert_with(Word::default);
                current.raw.push(c);
                current.value.push(c);
            }
        }
    }
    flush(&mut word, &mut tokens);

    validate(&tokens)?;
    Ok(ParsedCommand { tokens })
}

fn flush(word: &mut Option<Word>, tokens: &mut Vec<Token>) {
    if let Some(word) = word.take() {
        tokens.push(Token::Word(word));
    }
}

fn validate(tokens: &[Token]) -> Result<(), String> {
    if !tokens.iter().any(|t| matches!(t, Token::Word(_))) {
        return Err("Empty command".to_string());
    }

    let mut depth = 0usize;
    let mut prev: Option<&Token> = None;
    for token in tokens {
        match token {
            Token::Word(_) => {
                if matches!(prev, Some(Token::CloseGroup)) {
                    return Err("Unexpected word after subshell".to_string());
                }
            }
            Token::Operator(op) => {
                if !matches!(prev, Some(Token::Word(_)) | Some(Token::CloseGroup)) {
                    return Err(format!("Empty segment before '{}'", op.as_str()));
                }
            }
            Token::OpenGroup => {
                if !matches!(
                    prev,
                    None | Some(Token::Operator(_)) | Some(Token::OpenGroup)
                ) {
                    return Err("Unexpected '('".to_string());
                }
                depth += 1;
            }
            Token::CloseGroup => {
                if depth == 0 {
                    return Err("Unbalanced parentheses".to_string());
                }
                if !matches!(prev, Some(Token::Word(_)) | Some(Token::CloseGroup)) {
                    return Err("Empty subshell".to_string());
                }
                depth -= 1;
            }
        }
        prev = Some(token);
    }

    if depth != 0 {
        return Err("Unbalanced parentheses".to_string());
    }
    match prev {
        Some(Token::Operator(op)) if *op != Operator::Sequence => {
            Err(format!("Command ends with '{}'", op.as_str()))
        }
        _ => Ok(()),
    }
}

/// Rebuilds a command, letting `render_word(segment, index, word)` choose
/// each word's text. Operators and groups are emitted verbatim.
pub fn render<F>(parsed: &ParsedCommand, mut render_word: F) -> Result<String, SanitizeError>
where
    F: FnMut(usize, usize, &Word) -> Result<String, SanitizeError>,
{
    let mut parts = Vec::with_capacity(parsed.tokens.len());
    let mut segment: Option<usize> = None;
    let mut index = 0usize;
    let mut in_segment = false;

    for token in &parsed.tokens {
        match token {
            Token::Word(word) => {
                if !in_segment {
                    segment = Some(segment.map_or(0, |s| s + 1));
                    index = 0;
                    in_segment = true;
                }
                let current = segment.unwrap_or_default();
                parts.push(render_word(current, index, word)?);
                index += 1;
            }
            Token::Operator(op) => {
                in_segment = false;
                parts.push(op.as_str().to_string());
            }
            Token::OpenGroup => {
                in_segment = false;
                parts.push("(".to_string());
            }
            Token::CloseGroup => {
                in_segment = false;
                parts.push(")".to_string());
            }
        }
    }
    Ok(parts.join(" "))
}

/// Quotes `value` so the shell passes it through without any expansion.
pub fn quote_literal(value: &str) -> Result<String, SanitizeError> {
    if value.contains('\0') {
        return Err(SanitizeError::NulByte);
    }
    Ok(shell_words::quote(value).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment_values(command: &str) -> Vec<Vec<String>> {
        parse(command)
            .unwrap()
            .segments()
            .iter()
            .map(|s| s.iter().map(|w| w.value.clone()).collect())
            .collect()
    }

    #[test]
    fn test_splits_on_operators() {
        let segments = segment_values("ls -la && grep foo | wc -l; echo done || true");
        assert_eq!(segments.len(), 5);
        assert_eq!(segments[0], vec!["ls", "-la"]);
        assert_eq!(segments[1], vec!["grep", "foo"]);
        assert_eq!(segments[2], vec!["wc", "-l"]);
        assert_eq!(segments[4], vec!["true"]);
    }

    #[test]
    fn test_operators_in_quotes_are_literal() {
        let segments = segment_values("echo 'a|b && c' \"x;y\"");
        assert_eq!(segments, vec![vec!["echo", "a|b && c", "x;y"]]);
    }

    #[test]
    fn test_operators_without_spaces() {
        let segments = segment_values("ls&&pwd|wc");
        assert_eq!(segments.len(), 3);
    }

    #[test]
    fn test_subshell_groups() {
        let segments = segment_values("(cd /tmp && ls) | sort");
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[0][0], "cd");
        assert_eq!(segments[2][0], "sort");
    }

    #[test]
    fn test_escapes_and_double_quotes() {
        let segments = segment_values(r#"echo a\ b "c \"d\" \n""#);
        assert_eq!(segments[0][1], "a b");
        assert_eq!(segments[0][2], "c \"d\" \\n");
    }

    #[test]
    fn test_rejects_unanalyzable_constructs() {
        assert!(parse("echo $(whoami)").unwrap_err().contains("substitution"));
        assert!(parse("echo `whoami`").unwrap_err().contains("substitution"));
        assert!(parse("echo \"$(id)\"").unwrap_err().contains("substitution"));
        assert!(parse("ls > out").unwrap_err().contains("redirection"));
        assert!(parse("diff <(ls) x").unwrap_err().contains("redirection"));
        assert!(parse("sleep 1 &").unwrap_err().contains("background"));
        assert!(parse("ls\nrm -rf /").unwrap_err().contains("newlines"));
        assert!(parse("echo 'oops").unwrap_err().contains("Unterminated"));
        assert!(parse("(ls").unwrap_err().contains("Unbalanced"));
        assert!(parse("ls)").unwrap_err().contains("Unbalanced"));
        assert!(parse("ls && && pwd").unwrap_err().contains("Empty segment"));
        assert!(parse("ls |").unwrap_err().contains("ends with"));
        assert!(parse("   ").unwrap_err().contains("Empty command"));
    }

    #[test]
    fn test_single_quoted_substitution_is_literal() {
        let segments = segment_values("echo '$(whoami)'");
        assert_eq!(segments[0][1], "$(whoami)");
    }

    #[test]
    fn test_trailing_semicolon_allowed() {
        assert_eq!(segment_values("ls;").len(), 1);
    }

    #[test]
    fn test_render_keeps_structure() {
        let parsed = parse("(ls -la) | grep 'a b'").unwrap();
        let rendered = render(&parsed, |_, _, word| Ok(word.raw.clone())).unwrap();
        assert_eq!(rendered, "( ls -la ) | grep 'a b'");
    }

    #[test]
    fn test_render_reports_segment_and_index() {
        let parsed = parse("a b | c d").unwrap();
        let rendered = render(&parsed, |segment, index, _| Ok(format!("{segment}.{index}"))).unwrap();
        assert_eq!(rendered, "0.0 0.1 | 1.0 1.1");
    }

    #[test]
    fn test_quote_literal() {
        assert_eq!(quote_literal("*.txt").unwrap(), "'*.txt'");
        assert_eq!(quote_literal("$HOME").unwrap(), "'$HOME'");
        assert_eq!(quote_literal("").unwrap(), "''");
        assert_eq!(quote_literal("a\0b"), Err(SanitizeError::NulByte));
    }
}
