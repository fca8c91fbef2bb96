// Logmet -- extract metrics from log streams
// Copyright (C) 2025  The logmet authors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::fmt;
use std::time::Duration;

use super::Diagnostic;
use super::ast::{Pos, Span};
use crate::duration::scan_duration;

/// Tokens of the metric program language.
#[derive(Clone, Debug, PartialEq)]
pub enum Tok {
    Ident(String),
    CapRef(String),
    IntLit(i64),
    FloatLit(f64),
    StrLit(String),
    RegexLit(String),
    DurationLit(Duration),
    // Keywords
    Counter,
    Gauge,
    Timer,
    Text,
    Histogram,
    Hidden,
    Const,
    By,
    As,
    Next,
    Def,
    Del,
    After,
    Else,
    Otherwise,
    Buckets,
    // Operators and punctuation
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Pow,
    Assign,
    AddAssign,
    Inc,
    Dec,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    Match,
    NotMatch,
    AndAnd,
    OrOr,
    Not,
    BitNot,
    Shl,
    Shr,
    BitAnd,
    BitOr,
    BitXor,
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Dot,
    Newline,
    Eof,
}

impl Tok {
    /// Short name used in error messages.
    pub fn describe(&self) -> String {
        match self {
            Tok::Ident(name) => format!("identifier `{name}`"),
            Tok::CapRef(name) => format!("capture reference `${name}`"),
            Tok::IntLit(value) => format!("integer `{value}`"),
            Tok::FloatLit(value) => format!("float `{value}`"),
            Tok::StrLit(_) => String::from("string literal"),
            Tok::RegexLit(_) => String::from("regex literal"),
            Tok::DurationLit(_) => String::from("duration literal"),
            Tok::Newline => String::from("end of line"),
            Tok::Eof => String::from("end of file"),
            other => format!("`{}`", other.symbol()),
        }
    }

    fn symbol(&self) -> &'static str {
        match self {
            Tok::Counter => "counter",
            Tok::Gauge => "gauge",
            Tok::Timer => "timer",
            Tok::Text => "text",
            Tok::Histogram => "histogram",
            Tok::Hidden => "hidden",
            Tok::Const => "const",
            Tok::By => "by",
            Tok::As => "as",
            Tok::Next => "next",
            Tok::Def => "def",
            Tok::Del => "del",
            Tok::After => "after",
            Tok::Else => "else",
            Tok::Otherwise => "otherwise",
            Tok::Buckets => "buckets",
            Tok::Plus => "+",
            Tok::Minus => "-",
            Tok::Star => "*",
            Tok::Slash => "/",
            Tok::Percent => "%",
            Tok::Pow => "**",
            Tok::Assign => "=",
            Tok::AddAssign => "+=",
            Tok::Inc => "++",
            Tok::Dec => "--",
            Tok::Lt => "<",
            Tok::Le => "<=",
            Tok::Gt => ">",
            Tok::Ge => ">=",
            Tok::Eq => "==",
            Tok::Ne => "!=",
            Tok::Match => "=~",
            Tok::NotMatch => "!~",
            Tok::AndAnd => "&&",
            Tok::OrOr => "||",
            Tok::Not => "!",
            Tok::BitNot => "~",
            Tok::Shl => "<<",
            Tok::Shr => ">>",
            Tok::BitAnd => "&",
            Tok::BitOr => "|",
            Tok::BitXor => "^",
            Tok::LParen => "(",
            Tok::RParen => ")",
            Tok::LBracket => "[",
            Tok::RBracket => "]",
            Tok::LBrace => "{",
            Tok::RBrace => "}",
            Tok::Comma => ",",
            Tok::Dot => ".",
            _ => "?",
        }
    }
}

impl fmt::Display for Tok {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.describe())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Token {
    pub tok: Tok,
    pub span: Span,
}

fn keyword(name: &str) -> Option<Tok> {
    Some(match name {
        "counter" => Tok::Counter,
        "gauge" => Tok::Gauge,
        "timer" => Tok::Timer,
        "text" => Tok::Text,
        "histogram" => Tok::Histogram,
        "hidden" => Tok::Hidden,
        "const" => Tok::Const,
        "by" => Tok::By,
        "as" => Tok::As,
        "next" => Tok::Next,
        "def" => Tok::Def,
        "del" => Tok::Del,
        "after" => Tok::After,
        "else" => Tok::Else,
        "otherwise" => Tok::Otherwise,
        "buckets" => Tok::Buckets,
        _ => return None,
    })
}

/// Turn a source file into tokens, accumulating every lexical error.
pub fn lex(source: &str) -> (Vec<Token>, Vec<Diagnostic>) {
    Lexer::new(source).run()
}

struct Lexer {
    chars: Vec<char>,
    offset: usize,
    line: u32,
    col: u32,
    /// A `/` starts a regex literal unless the previous token ended an
    /// operand, in which case it is a division.
    after_operand: bool,
    tokens: Vec<Token>,
    errors: Vec<Diagnostic>,
}

impl Lexer {
    fn new(source: &str) -> Lexer {
        Lexer {
            chars: source.chars().collect(),
            offset: 0,
            line: 1,
            col: 1,
            after_operand: false,
            tokens: Vec::new(),
            errors: Vec::new(),
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.offset).copied()
    }

    fn peek_at(&self, ahead: usize) -> Option<char> {
        self.chars.get(self.offset + ahead).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.offset += 1;
        if c == '\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(c)
    }

    fn pos(&self) -> Pos {
        Pos::new(self.line, self.col)
    }

    fn push(&mut self, tok: Tok, start: Pos) {
        self.after_operand = matches!(
            tok,
            Tok::Ident(_)
                | Tok::CapRef(_)
                | Tok::IntLit(_)
                | Tok::FloatLit(_)
                | Tok::StrLit(_)
                | Tok::DurationLit(_)
                | Tok::RParen
                | Tok::RBracket
        );
        self.tokens.push(Token {
            tok,
            span: Span::new(start, self.pos()),
        });
    }

    fn error(&mut self, pos: Pos, message: String) {
        self.errors.push(Diagnostic { pos, message });
    }

    fn run(mut self) -> (Vec<Token>, Vec<Diagnostic>) {
        while let Some(c) = self.peek() {
            let start = self.pos();
            match c {
                ' ' | '\t' | '\r' => {
                    self.bump();
                }
                '\n' => {
                    self.bump();
                    self.push(Tok::Newline, start);
                    self.after_operand = false;
                }
                '#' => {
                    while let Some(c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                '"' => self.string(start),
                '$' => self.capref(start),
                '/' if !self.after_operand => self.regex(start),
                c if c.is_ascii_digit() => self.number(start),
                c if c.is_ascii_alphabetic() || c == '_' => self.ident(start),
                _ => self.operator(start),
            }
        }
        let end = self.pos();
        self.tokens.push(Token {
            tok: Tok::Eof,
            span: Span::new(end, end),
        });
        (self.tokens, self.errors)
    }

    fn string(&mut self, start: Pos) {
        self.bump(); // opening quote
        let mut value = String::new();
        loop {
            match self.bump() {
                None | Some('\n') => {
                    self.error(start, String::from("unterminated string literal"));
                    self.push(Tok::StrLit(value), start);
                    return;
                }
                Some('"') => break,
                Some('\\') => match self.bump() {
                    Some('"') => value.push('"'),
                    Some('\\') => value.push('\\'),
                    Some('n') => value.push('\n'),
                    Some('t') => value.push('\t'),
                    Some(other) => {
                        self.error(start, format!("invalid escape `\\{other}` in string"));
                    }
                    None => {
                        self.error(start, String::from("unterminated string literal"));
                        self.push(Tok::StrLit(value), start);
                        return;
                    }
                },
                Some(other) => value.push(other),
            }
        }
        self.push(Tok::StrLit(value), start);
    }

    fn regex(&mut self, start: Pos) {
        self.bump(); // opening slash
        let mut value = String::new();
        loop {
            match self.bump() {
                None | Some('\n') => {
                    self.error(start, String::from("unterminated regex literal"));
                    break;
                }
                Some('/') => break,
                Some('\\') => match self.peek() {
                    // Only the delimiter escape is resolved here; everything
                    // else belongs to the regex engine.
                    Some('/') => {
                        value.push('/');
                        self.bump();
                    }
                    _ => value.push('\\'),
                },
                Some(other) => value.push(other),
            }
        }
        self.push(Tok::RegexLit(value), start);
    }

    fn capref(&mut self, start: Pos) {
        self.bump(); // dollar
        let mut name = String::new();
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == '_' {
                name.push(c);
                self.bump();
            } else {
                break;
            }
        }
        if name.is_empty() {
            self.error(start, String::from("`$` must be followed by a group name or number"));
        }
        self.push(Tok::CapRef(name), start);
    }

    fn number(&mut self, start: Pos) {
        let number_start = self.offset;
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.bump();
        }
        match self.peek() {
            Some('.') if self.peek_at(1).is_some_and(|c| c.is_ascii_digit()) => {
                self.bump();
                while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                    self.bump();
                }
                let text: String = self.chars[number_start..self.offset].iter().collect();
                match text.parse::<f64>() {
                    Ok(value) => self.push(Tok::FloatLit(value), start),
                    Err(_) => self.error(start, format!("invalid float literal `{text}`")),
                }
            }
            Some(c) if c.is_ascii_alphabetic() => {
                // Duration literal such as 90s or 1h30m.
                let rest: String = self.chars[number_start..].iter().collect();
                match scan_duration(&rest) {
                    Ok((value, len)) => {
                        while self.offset < number_start + len {
                            self.bump();
                        }
                        if self.peek().is_some_and(|c| c.is_ascii_alphanumeric()) {
                            let text: String =
                                self.chars[number_start..=self.offset].iter().collect();
                            self.error(start, format!("invalid number `{text}`"));
                            self.bump();
                        } else {
                            self.push(Tok::DurationLit(value), start);
                        }
                    }
                    Err(_) => {
                        let text: String =
                            self.chars[number_start..=self.offset].iter().collect();
                        self.error(start, format!("invalid number `{text}`"));
                        self.bump();
                    }
                }
            }
            _ => {
                let text: String = self.chars[number_start..self.offset].iter().collect();
                match text.parse::<i64>() {
                    Ok(value) => self.push(Tok::IntLit(value), start),
                    Err(_) => self.error(start, format!("integer `{text}` out of range")),
                }
            }
        }
    }

    fn ident(&mut self, start: Pos) {
        let ident_start = self.offset;
        while self
            .peek()
            .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            self.bump();
        }
        let name: String = self.chars[ident_start..self.offset].iter().collect();
        match keyword(&name) {
            Some(tok) => self.push(tok, start),
            None => self.push(Tok::Ident(name), start),
        }
    }

    fn operator(&mut self, start: Pos) {
        let first = self.bump().expect("operator lookahead");
        let second = self.peek();
        let tok = match (first, second) {
            ('*', Some('*')) => {
                self.bump();
                Tok::Pow
            }
            ('+', Some('+')) => {
                self.bump();
                Tok::Inc
            }
            ('+', Some('=')) => {
                self.bump();
                Tok::AddAssign
            }
            ('-', Some('-')) => {
                self.bump();
                Tok::Dec
            }
            ('=', Some('=')) => {
                self.bump();
                Tok::Eq
            }
            ('=', Some('~')) => {
                self.bump();
                Tok::Match
            }
            ('!', Some('=')) => {
                self.bump();
                Tok::Ne
            }
            ('!', Some('~')) => {
                self.bump();
                Tok::NotMatch
            }
            ('<', Some('=')) => {
                self.bump();
                Tok::Le
            }
            ('<', Some('<')) => {
                self.bump();
                Tok::Shl
            }
            ('>', Some('=')) => {
                self.bump();
                Tok::Ge
            }
            ('>', Some('>')) => {
                self.bump();
                Tok::Shr
            }
            ('&', Some('&')) => {
                self.bump();
                Tok::AndAnd
            }
            ('|', Some('|')) => {
                self.bump();
                Tok::OrOr
            }
            ('+', _) => Tok::Plus,
            ('-', _) => Tok::Minus,
            ('*', _) => Tok::Star,
            ('/', _) => Tok::Slash,
            ('%', _) => Tok::Percent,
            ('=', _) => Tok::Assign,
            ('<', _) => Tok::Lt,
            ('>', _) => Tok::Gt,
            ('!', _) => Tok::Not,
            ('~', _) => Tok::BitNot,
            ('&', _) => Tok::BitAnd,
            ('|', _) => Tok::BitOr,
            ('^', _) => Tok::BitXor,
            ('(', _) => Tok::LParen,
            (')', _) => Tok::RParen,
            ('[', _) => Tok::LBracket,
            (']', _) => Tok::RBracket,
            ('{', _) => Tok::LBrace,
            ('}', _) => Tok::RBrace,
            (',', _) => Tok::Comma,
            ('.', _) => Tok::Dot,
            (other, _) => {
                self.error(start, format!("unexpected character `{other}`"));
                return;
            }
        };
        self.push(tok, start);
    }
}

#[cfg(test)]
mod tests {

    use rstest::rstest;
    use std::time::Duration;

    use super::{Tok, lex};

    fn toks(source: &str) -> Vec<Tok> {
        let (tokens, errors) = lex(source);
        assert!(errors.is_empty(), "unexpected errors: {errors:?}");
        tokens.into_iter().map(|token| token.tok).collect()
    }

    #[test]
    fn keywords_and_identifiers() {
        assert_eq!(
            vec![
                Tok::Counter,
                Tok::Ident(String::from("requests")),
                Tok::By,
                Tok::Ident(String::from("method")),
                Tok::Eof,
            ],
            toks("counter requests by method")
        );
    }

    #[test]
    fn regex_literal_with_escaped_delimiter() {
        assert_eq!(
            vec![Tok::RegexLit(String::from(r"a/b\d+")), Tok::Eof],
            toks(r"/a\/b\d+/")
        );
    }

    #[test]
    fn slash_after_operand_is_division() {
        assert_eq!(
            vec![
                Tok::CapRef(String::from("1")),
                Tok::Slash,
                Tok::IntLit(2),
                Tok::Eof,
            ],
            toks("$1 / 2")
        );
    }

    #[test]
    fn slash_after_match_operator_is_regex() {
        assert_eq!(
            vec![
                Tok::CapRef(String::from("1")),
                Tok::Match,
                Tok::RegexLit(String::from("GET")),
                Tok::Eof,
            ],
            toks("$1 =~ /GET/")
        );
    }

    #[rstest]
    #[case("1 + 2", vec![Tok::IntLit(1), Tok::Plus, Tok::IntLit(2), Tok::Eof])]
    #[case("x++", vec![Tok::Ident(String::from("x")), Tok::Inc, Tok::Eof])]
    #[case("x += 1", vec![Tok::Ident(String::from("x")), Tok::AddAssign, Tok::IntLit(1), Tok::Eof])]
    #[case("a ** b", vec![Tok::Ident(String::from("a")), Tok::Pow, Tok::Ident(String::from("b")), Tok::Eof])]
    #[case("a != b", vec![Tok::Ident(String::from("a")), Tok::Ne, Tok::Ident(String::from("b")), Tok::Eof])]
    #[case("a !~ b", vec![Tok::Ident(String::from("a")), Tok::NotMatch, Tok::Ident(String::from("b")), Tok::Eof])]
    #[case("a << 2", vec![Tok::Ident(String::from("a")), Tok::Shl, Tok::IntLit(2), Tok::Eof])]
    fn operators(#[case] source: &str, #[case] expected: Vec<Tok>) {
        assert_eq!(expected, toks(source));
    }

    #[test]
    fn literals() {
        assert_eq!(
            vec![
                Tok::IntLit(42),
                Tok::FloatLit(0.5),
                Tok::StrLit(String::from("a\"b")),
                Tok::DurationLit(Duration::from_secs(5400)),
                Tok::Eof,
            ],
            toks(r#"42 0.5 "a\"b" 1h30m"#)
        );
    }

    #[test]
    fn comments_are_skipped() {
        assert_eq!(
            vec![
                Tok::Next,
                Tok::Newline,
                Tok::Ident(String::from("x")),
                Tok::Eof
            ],
            toks("next # increment\nx")
        );
    }

    #[test]
    fn newlines_are_tokens() {
        assert_eq!(vec![Tok::Newline, Tok::Newline, Tok::Eof], toks("\n\n"));
    }

    #[test]
    fn positions_are_tracked() {
        let (tokens, _) = lex("a\n  b");
        assert_eq!(1, tokens[0].span.start.line);
        assert_eq!(1, tokens[0].span.start.col);
        let b = &tokens[2];
        assert_eq!(2, b.span.start.line);
        assert_eq!(3, b.span.start.col);
    }

    #[test]
    fn unterminated_string_is_reported() {
        let (_, errors) = lex("\"abc");
        assert_eq!(1, errors.len());
        assert!(errors[0].message.contains("unterminated string"));
    }

    #[test]
    fn unterminated_regex_is_reported() {
        let (_, errors) = lex("/abc");
        assert_eq!(1, errors.len());
        assert!(errors[0].message.contains("unterminated regex"));
    }

    #[test]
    fn bad_number_suffix_is_reported() {
        let (_, errors) = lex("5x");
        assert_eq!(1, errors.len());
    }

    #[test]
    fn lone_dollar_is_reported() {
        let (_, errors) = lex("$ ");
        assert_eq!(1, errors.len());
    }
}
