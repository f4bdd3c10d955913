//! Tokenizer for the configuration language.

use std::sync::Arc;

use super::{ConfigError, Landmark};

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    /// Element or class name: letter or `_` first, then word chars
    /// plus `/` (compound paths) and `@` (anonymous names).
    Ident(String),
    /// `$name` parameter reference.
    Variable(String),
    /// Unsigned integer, used for port numbers.
    Number(usize),
    /// Raw text of a balanced `( ... )` group, outer parens stripped.
    Config(String),
    Arrow,
    DoubleColon,
    Semicolon,
    Comma,
    OpenBrace,
    CloseBrace,
    OpenBracket,
    CloseBracket,
    Bar,
}

#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    pub landmark: Landmark,
}

struct Lexer<'a> {
    src: &'a [u8],
    pos: usize,
    line: u32,
    file: Arc<String>,
}

impl<'a> Lexer<'a> {
    fn landmark(&self) -> Landmark {
        Landmark::new(Arc::clone(&self.file), self.line)
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn peek2(&self) -> Option<u8> {
        self.src.get(self.pos + 1).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let c = self.peek()?;
        self.pos += 1;
        if c == b'\n' {
            self.line += 1;
        }
        Some(c)
    }

    fn error(&self, msg: impl Into<String>) -> ConfigError {
        ConfigError::Syntax {
            landmark: self.landmark(),
            msg: msg.into(),
        }
    }

    /// Skip whitespace and comments. Newlines act as statement
    /// separators, so they are reported to the caller.
    fn skip_trivia(&mut self) -> bool {
        let mut saw_newline = false;
        loop {
            match self.peek() {
                Some(b'\n') => {
                    saw_newline = true;
                    self.bump();
                }
                Some(c) if c.is_ascii_whitespace() => {
                    self.bump();
                }
                Some(b'#') => {
                    while let Some(c) = self.peek() {
                        if c == b'\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                Some(b'/') if self.peek2() == Some(b'/') => {
                    while let Some(c) = self.peek() {
                        if c == b'\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                Some(b'/') if self.peek2() == Some(b'*') => {
                    self.bump();
                    self.bump();
                    loop {
                        match self.bump() {
                            Some(b'*') if self.peek() == Some(b'/') => {
                                self.bump();
                                break;
                            }
                            Some(_) => {}
                            None => return saw_newline,
                        }
                    }
                }
                _ => return saw_newline,
            }
        }
    }

    fn lex_ident(&mut self) -> String {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == b'_' || c == b'/' || c == b'@' {
                self.bump();
            } else {
                break;
            }
        }
        String::from_utf8_lossy(&self.src[start..self.pos]).into_owned()
    }

    fn lex_number(&mut self) -> Result<usize, ConfigError> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                self.bump();
            } else {
                break;
            }
        }
        let text = String::from_utf8_lossy(&self.src[start..self.pos]).into_owned();
        text.parse()
            .map_err(|_| self.error(format!("bad number '{}'", text)))
    }

    /// Scan a balanced parenthesis group, honoring nesting, quoted
    /// strings, and comments. Returns the interior text verbatim.
    fn lex_config(&mut self) -> Result<String, ConfigError> {
        let open_landmark = self.landmark();
        self.bump(); // consume '('
        let start = self.pos;
        let mut depth = 1usize;
        loop {
            match self.peek() {
                None => {
                    return Err(ConfigError::Syntax {
                        landmark: open_landmark,
                        msg: "unterminated '(' in configuration".into(),
                    })
                }
                Some(b'(') => {
                    depth += 1;
                    self.bump();
                }
                Some(b')') => {
                    depth -= 1;
                    if depth == 0 {
                        let text =
                            String::from_utf8_lossy(&self.src[start..self.pos]).into_owned();
                        self.bump(); // consume ')'
                        return Ok(text.trim().to_string());
                    }
                    self.bump();
                }
                Some(b'"') => {
                    self.bump();
                    loop {
                        match self.bump() {
                            Some(b'\\') => {
                                self.bump();
                            }
                            Some(b'"') => break,
                            Some(_) => {}
                            None => {
                                return Err(ConfigError::Syntax {
                                    landmark: open_landmark,
                                    msg: "unterminated string in configuration".into(),
                                })
                            }
                        }
                    }
                }
                Some(b'/') if self.peek2() == Some(b'*') => {
                    self.bump();
                    self.bump();
                    loop {
                        match self.bump() {
                            Some(b'*') if self.peek() == Some(b'/') => {
                                self.bump();
                                break;
                            }
                            Some(_) => {}
                            None => break,
                        }
                    }
                }
                Some(_) => {
                    self.bump();
                }
            }
        }
    }
}

/// Tokenize configuration text. Newlines between statements become
/// semicolons; newlines inside a statement (after `->`, `::`, `,` or
/// an opening brace) are plain whitespace, so multi-line chains read
/// naturally.
pub fn tokenize(text: &str, filename: &str) -> Result<Vec<Token>, ConfigError> {
    let file = Arc::new(filename.to_string());
    let mut lx = Lexer {
        src: text.as_bytes(),
        pos: 0,
        line: 1,
        file,
    };
    let mut tokens: Vec<Token> = Vec::new();

    loop {
        let saw_newline = lx.skip_trivia();
        if saw_newline {
            // a newline ends the statement unless the last token keeps
            // it open
            let keeps_open = matches!(
                tokens.last().map(|t| &t.kind),
                Some(TokenKind::Arrow)
                    | Some(TokenKind::DoubleColon)
                    | Some(TokenKind::Comma)
                    | Some(TokenKind::OpenBrace)
                    | Some(TokenKind::Bar)
                    | Some(TokenKind::Semicolon)
                    | Some(TokenKind::OpenBracket)
                    | None
            );
            if !keeps_open {
                tokens.push(Token {
                    kind: TokenKind::Semicolon,
                    landmark: lx.landmark(),
                });
            }
        }

        let landmark = lx.landmark();
        let kind = match lx.peek() {
            None => break,
            Some(c) if c.is_ascii_alphabetic() || c == b'_' => TokenKind::Ident(lx.lex_ident()),
            Some(c) if c.is_ascii_digit() => TokenKind::Number(lx.lex_number()?),
            Some(b'$') => {
                lx.bump();
                let name = lx.lex_ident();
                if name.is_empty() {
                    return Err(lx.error("'$' must be followed by a parameter name"));
                }
                TokenKind::Variable(name)
            }
            Some(b'(') => TokenKind::Config(lx.lex_config()?),
            Some(b'-') if lx.peek2() == Some(b'>') => {
                lx.bump();
                lx.bump();
                TokenKind::Arrow
            }
            Some(b':') if lx.peek2() == Some(b':') => {
                lx.bump();
                lx.bump();
                TokenKind::DoubleColon
            }
            Some(b';') => {
                lx.bump();
                TokenKind::Semicolon
            }
            Some(b',') => {
                lx.bump();
                TokenKind::Comma
            }
            Some(b'{') => {
                lx.bump();
                TokenKind::OpenBrace
            }
            Some(b'}') => {
                lx.bump();
                TokenKind::CloseBrace
            }
            Some(b'[') => {
                lx.bump();
                TokenKind::OpenBracket
            }
            Some(b']') => {
                lx.bump();
                TokenKind::CloseBracket
            }
            Some(b'|') => {
                lx.bump();
                TokenKind::Bar
            }
            Some(c) => return Err(lx.error(format!("unexpected character '{}'", c as char))),
        };
        tokens.push(Token { kind, landmark });
    }

    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(text: &str) -> Vec<TokenKind> {
        tokenize(text, "test")
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn test_declaration_tokens() {
        let toks = kinds("src :: InfiniteSource(LENGTH 64);");
        assert_eq!(
            toks,
            vec![
                TokenKind::Ident("src".into()),
                TokenKind::DoubleColon,
                TokenKind::Ident("InfiniteSource".into()),
                TokenKind::Config("LENGTH 64".into()),
                TokenKind::Semicolon,
            ]
        );
    }

    #[test]
    fn test_connection_with_ports() {
        let toks = kinds("a [1] -> [0] b");
        assert_eq!(
            toks,
            vec![
                TokenKind::Ident("a".into()),
                TokenKind::OpenBracket,
                TokenKind::Number(1),
                TokenKind::CloseBracket,
                TokenKind::Arrow,
                TokenKind::OpenBracket,
                TokenKind::Number(0),
                TokenKind::CloseBracket,
                TokenKind::Ident("b".into()),
            ]
        );
    }

    #[test]
    fn test_newline_ends_statement() {
        let toks = kinds("a -> b\nc -> d");
        assert!(toks.contains(&TokenKind::Semicolon));
        // but not after a trailing arrow
        let toks = kinds("a ->\n  b");
        assert!(!toks.contains(&TokenKind::Semicolon));
    }

    #[test]
    fn test_comments_are_trivia() {
        let toks = kinds("a /* x -> y */ -> b // tail\n# whole line\nc :: Idle");
        assert_eq!(
            toks.iter()
                .filter(|k| matches!(k, TokenKind::Arrow))
                .count(),
            1
        );
        assert!(toks.contains(&TokenKind::Ident("c".into())));
    }

    #[test]
    fn test_nested_config_parens() {
        let toks = kinds("q :: Queue(CAPACITY (2 * 8))");
        assert!(toks.contains(&TokenKind::Config("CAPACITY (2 * 8)".into())));
    }

    #[test]
    fn test_config_with_quoted_paren() {
        let toks = kinds(r#"x :: Foo(DATA ")unbalanced")"#);
        assert!(toks.contains(&TokenKind::Config(r#"DATA ")unbalanced""#.into())));
    }

    #[test]
    fn test_unterminated_config() {
        assert!(tokenize("x :: Foo(LENGTH 64", "test").is_err());
    }

    #[test]
    fn test_landmark_lines() {
        let toks = tokenize("a -> b;\n\nc -> d;", "conf").unwrap();
        let c = toks
            .iter()
            .find(|t| t.kind == TokenKind::Ident("c".into()))
            .unwrap();
        assert_eq!(c.landmark.line(), 3);
        assert_eq!(c.landmark.to_string(), "conf:3");
    }
}
