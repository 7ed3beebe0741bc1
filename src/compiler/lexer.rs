//! Tokenizer for expression source text.
//!
//! Token classification follows a fixed priority: a leading digit or `.` is always a number; a
//! quote starts a string literal (wave names); anything else that starts with an identifier
//! character is read as a whole word and handed to the parser, which resolves it as an operator
//! call or a variable reference. `#` starts a line comment.

use crate::error::CompileDiagnostic;

#[derive(Clone, Debug, PartialEq)]
pub enum Token {
    Number(f32),
    Ident(String),
    Str(String),
    Symbol(char),
    Eof,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub position: usize,
}

pub struct Lexer<'a> {
    source: &'a [u8],
    pos: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(source: &'a str) -> Self {
        Self {
            source: source.as_bytes(),
            pos: 0,
        }
    }

    pub fn tokenize(mut self) -> Result<Vec<Spanned>, CompileDiagnostic> {
        let mut tokens = Vec::new();
        loop {
            let tok = self.next_token()?;
            let eof = tok.token == Token::Eof;
            tokens.push(tok);
            if eof {
                break;
            }
        }
        Ok(tokens)
    }

    fn peek(&self) -> Option<u8> {
        self.source.get(self.pos).copied()
    }

    fn advance(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        Some(b)
    }

    fn skip_whitespace_and_comments(&mut self) {
        loop {
            match self.peek() {
                Some(b) if b.is_ascii_whitespace() => {
                    self.pos += 1;
                }
                Some(b'#') => {
                    while let Some(b) = self.peek() {
                        if b == b'\n' {
                            break;
                        }
                        self.pos += 1;
                    }
                }
                _ => break,
            }
        }
    }

    fn next_token(&mut self) -> Result<Spanned, CompileDiagnostic> {
        self.skip_whitespace_and_comments();
        let start = self.pos;

        let Some(b) = self.peek() else {
            return Ok(Spanned {
                token: Token::Eof,
                position: start,
            });
        };

        if b.is_ascii_digit() || (b == b'.' && self.starts_number_after_dot()) {
            return self.lex_number(start);
        }

        if b == b'\'' || b == b'"' {
            return self.lex_string(start, b);
        }

        if is_ident_start(b) {
            return self.lex_ident(start);
        }

        // `=` is its own symbol (default-value assignment inside a call); everything else in
        // the operator/punctuation set is single-character.
        self.advance();
        Ok(Spanned {
            token: Token::Symbol(b as char),
            position: start,
        })
    }

    fn starts_number_after_dot(&self) -> bool {
        self.source
            .get(self.pos + 1)
            .is_some_and(|b| b.is_ascii_digit())
    }

    fn lex_number(&mut self, start: usize) -> Result<Spanned, CompileDiagnostic> {
        while let Some(b) = self.peek() {
            if b.is_ascii_digit() || b == b'.' {
                self.pos += 1;
            } else {
                break;
            }
        }
        // Scientific notation, e.g. `1e-3`.
        if matches!(self.peek(), Some(b'e') | Some(b'E')) {
            let save = self.pos;
            self.pos += 1;
            if matches!(self.peek(), Some(b'+') | Some(b'-')) {
                self.pos += 1;
            }
            if self.peek().is_some_and(|b| b.is_ascii_digit()) {
                while self.peek().is_some_and(|b| b.is_ascii_digit()) {
                    self.pos += 1;
                }
            } else {
                self.pos = save;
            }
        }
        let text = std::str::from_utf8(&self.source[start..self.pos]).unwrap();
        let value = text
            .parse::<f32>()
            .map_err(|_| CompileDiagnostic::new(start, format!("invalid number literal '{text}'")))?;
        Ok(Spanned {
            token: Token::Number(value),
            position: start,
        })
    }

    fn lex_string(&mut self, start: usize, quote: u8) -> Result<Spanned, CompileDiagnostic> {
        self.advance(); // opening quote
        let body_start = self.pos;
        loop {
            match self.advance() {
                Some(b) if b == quote => break,
                Some(_) => continue,
                None => {
                    return Err(CompileDiagnostic::new(start, "unterminated string literal"));
                }
            }
        }
        let text = std::str::from_utf8(&self.source[body_start..self.pos - 1]).unwrap();
        Ok(Spanned {
            token: Token::Str(text.to_string()),
            position: start,
        })
    }

    fn lex_ident(&mut self, start: usize) -> Result<Spanned, CompileDiagnostic> {
        while let Some(b) = self.peek() {
            if is_ident_continue(b) {
                self.pos += 1;
            } else {
                break;
            }
        }
        let text = std::str::from_utf8(&self.source[start..self.pos]).unwrap();
        Ok(Spanned {
            token: Token::Ident(text.to_string()),
            position: start,
        })
    }
}

fn is_ident_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_'
}

fn is_ident_continue(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(src: &str) -> Vec<Token> {
        Lexer::new(src)
            .tokenize()
            .unwrap()
            .into_iter()
            .map(|s| s.token)
            .collect()
    }

    #[test]
    fn lexes_call_with_named_default() {
        let t = toks("sin(hz=440)");
        assert_eq!(
            t,
            vec![
                Token::Ident("sin".into()),
                Token::Symbol('('),
                Token::Ident("hz".into()),
                Token::Symbol('='),
                Token::Number(440.0),
                Token::Symbol(')'),
                Token::Eof,
            ]
        );
    }

    #[test]
    fn skips_comments() {
        let t = toks("1 + 2 # trailing note\n");
        assert_eq!(
            t,
            vec![
                Token::Number(1.0),
                Token::Symbol('+'),
                Token::Number(2.0),
                Token::Eof,
            ]
        );
    }

    #[test]
    fn lexes_wave_name_string() {
        let t = toks("wave('kick', 1.0)");
        assert_eq!(t[2], Token::Str("kick".into()));
    }
}
