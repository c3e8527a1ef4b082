use crate::core::errors::*;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenType {
    Eof,
    Illegal,

    Ident,
    String,
    Number,

    Select,
    From,
    Where,
    Join,
    Inner,
    On,
    Using,
    As,
    Group,
    Order,
    By,
    Asc,
    Desc,
    Limit,
    Insert,
    Update,
    Delete,
    GeodesicDistance,
    Curvature,
    Point,

    Eq,
    NotEq,
    Gt,
    Gte,
    Lt,
    Lte,

    Star,
    LParen,
    RParen,
    Comma,
    Dot,
    Semicolon,
}

impl fmt::Display for TokenType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TokenType::Eof => write!(f, "EOF"),
            TokenType::Illegal => write!(f, "ILLEGAL"),
            TokenType::Ident => write!(f, "IDENT"),
            TokenType::String => write!(f, "STRING"),
            TokenType::Number => write!(f, "NUMBER"),
            TokenType::Select => write!(f, "SELECT"),
            TokenType::From => write!(f, "FROM"),
            TokenType::Where => write!(f, "WHERE"),
            TokenType::Join => write!(f, "JOIN"),
            TokenType::Inner => write!(f, "INNER"),
            TokenType::On => write!(f, "ON"),
            TokenType::Using => write!(f, "USING"),
            TokenType::As => write!(f, "AS"),
            TokenType::Group => write!(f, "GROUP"),
            TokenType::Order => write!(f, "ORDER"),
            TokenType::By => write!(f, "BY"),
            TokenType::Asc => write!(f, "ASC"),
            TokenType::Desc => write!(f, "DESC"),
            TokenType::Limit => write!(f, "LIMIT"),
            TokenType::Insert => write!(f, "INSERT"),
            TokenType::Update => write!(f, "UPDATE"),
            TokenType::Delete => write!(f, "DELETE"),
            TokenType::GeodesicDistance => write!(f, "GEODESIC_DISTANCE"),
            TokenType::Curvature => write!(f, "CURVATURE"),
            TokenType::Point => write!(f, "POINT"),
            TokenType::Eq => write!(f, "="),
            TokenType::NotEq => write!(f, "!="),
            TokenType::Gt => write!(f, ">"),
            TokenType::Gte => write!(f, ">="),
            TokenType::Lt => write!(f, "<"),
            TokenType::Lte => write!(f, "<="),
            TokenType::Star => write!(f, "*"),
            TokenType::LParen => write!(f, "("),
            TokenType::RParen => write!(f, ")"),
            TokenType::Comma => write!(f, ","),
            TokenType::Dot => write!(f, "."),
            TokenType::Semicolon => write!(f, ";"),
        }
    }
}

static KEYWORDS: Lazy<HashMap<&'static str, TokenType>> = Lazy::new(|| {
    let mut map = HashMap::new();
    map.insert("select", TokenType::Select);
    map.insert("from", TokenType::From);
    map.insert("where", TokenType::Where);
    map.insert("join", TokenType::Join);
    map.insert("inner", TokenType::Inner);
    map.insert("on", TokenType::On);
    map.insert("using", TokenType::Using);
    map.insert("as", TokenType::As);
    map.insert("group", TokenType::Group);
    map.insert("order", TokenType::Order);
    map.insert("by", TokenType::By);
    map.insert("asc", TokenType::Asc);
    map.insert("desc", TokenType::Desc);
    map.insert("limit", TokenType::Limit);
    map.insert("insert", TokenType::Insert);
    map.insert("update", TokenType::Update);
    map.insert("delete", TokenType::Delete);
    map.insert("geodesic_distance", TokenType::GeodesicDistance);
    map.insert("curvature", TokenType::Curvature);
    map.insert("point", TokenType::Point);
    map
});

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub token_type: TokenType,
    pub value: String,
    pub pos: usize,
}

impl Token {
    fn new(token_type: TokenType, value: String, pos: usize) -> Self {
        Self {
            token_type,
            value,
            pos,
        }
    }

    /// How the token reads in an error message.
    pub fn describe(&self) -> String {
        match self.token_type {
            TokenType::Eof => "end of input".to_string(),
            TokenType::String => format!("'{}'", self.value),
            _ => self.value.clone(),
        }
    }
}

/// Character-at-a-time scanner; `ch` is the current character and `pos` the
/// index of the one after it.
pub struct Lexer {
    input: Vec<char>,
    pos: usize,
    ch: char,
}

impl Lexer {
    pub fn new(input: &str) -> Self {
        let chars: Vec<char> = input.chars().collect();
        let mut lexer = Self {
            input: chars,
            pos: 0,
            ch: '\0',
        };
        lexer.read_char();
        lexer
    }

    fn read_char(&mut self) {
        if self.pos >= self.input.len() {
            self.ch = '\0';
        } else {
            self.ch = self.input[self.pos];
        }
        self.pos += 1;
    }

    fn peek_char(&self) -> char {
        if self.pos >= self.input.len() {
            '\0'
        } else {
            self.input[self.pos]
        }
    }

    fn single(&mut self, token_type: TokenType, pos: usize) -> Token {
        let tok = Token::new(token_type, self.ch.to_string(), pos);
        self.read_char();
        tok
    }

    fn double(&mut self, token_type: TokenType, value: &str, pos: usize) -> Token {
        self.read_char();
        self.read_char();
        Token::new(token_type, value.to_string(), pos)
    }

    pub fn next_token(&mut self) -> Result<Token> {
        self.skip_whitespace();

        let token_pos = self.pos.saturating_sub(1);

        let token = match self.ch {
            '\0' if self.pos > self.input.len() => Token::new(TokenType::Eof, String::new(), token_pos),
            '(' => self.single(TokenType::LParen, token_pos),
            ')' => self.single(TokenType::RParen, token_pos),
            ',' => self.single(TokenType::Comma, token_pos),
            '.' => self.single(TokenType::Dot, token_pos),
            ';' => self.single(TokenType::Semicolon, token_pos),
            '*' => self.single(TokenType::Star, token_pos),
            '=' => self.single(TokenType::Eq, token_pos),
            '!' if self.peek_char() == '=' => self.double(TokenType::NotEq, "!=", token_pos),
            '>' if self.peek_char() == '=' => self.double(TokenType::Gte, ">=", token_pos),
            '>' => self.single(TokenType::Gt, token_pos),
            '<' if self.peek_char() == '=' => self.double(TokenType::Lte, "<=", token_pos),
            '<' if self.peek_char() == '>' => self.double(TokenType::NotEq, "<>", token_pos),
            '<' => self.single(TokenType::Lt, token_pos),
            '"' | '\'' => {
                let value = self.read_string(token_pos)?;
                Token::new(TokenType::String, value, token_pos)
            }
            '-' if self.peek_char().is_ascii_digit() => {
                let value = self.read_number();
                Token::new(TokenType::Number, value, token_pos)
            }
            _ => {
                if is_ident_start(self.ch) {
                    let value = self.read_identifier();
                    let token_type = lookup_keyword(&value);
                    Token::new(token_type, value, token_pos)
                } else if self.ch.is_ascii_digit() {
                    let value = self.read_number();
                    Token::new(TokenType::Number, value, token_pos)
                } else {
                    self.single(TokenType::Illegal, token_pos)
                }
            }
        };

        Ok(token)
    }

    fn skip_whitespace(&mut self) {
        while self.ch.is_whitespace() {
            self.read_char();
        }
    }

    fn read_identifier(&mut self) -> String {
        let start = self.pos - 1;
        while is_ident_start(self.ch) || self.ch.is_ascii_digit() {
            self.read_char();
        }
        self.input[start..self.pos - 1].iter().collect()
    }

    fn read_number(&mut self) -> String {
        let start = self.pos - 1;
        if self.ch == '-' {
            self.read_char();
        }
        while self.ch.is_ascii_digit() {
            self.read_char();
        }

        if self.ch == '.' && self.peek_char().is_ascii_digit() {
            self.read_char();
            while self.ch.is_ascii_digit() {
                self.read_char();
            }
        }

        if (self.ch == 'e' || self.ch == 'E')
            && (self.peek_char().is_ascii_digit() || self.peek_char() == '-' || self.peek_char() == '+')
        {
            self.read_char();
            if self.ch == '-' || self.ch == '+' {
                self.read_char();
            }
            while self.ch.is_ascii_digit() {
                self.read_char();
            }
        }

        self.input[start..self.pos - 1].iter().collect()
    }

    /// A doubled quote inside the literal stands for one quote character.
    fn read_string(&mut self, token_pos: usize) -> Result<String> {
        let quote = self.ch;
        let mut value = String::new();
        self.read_char();

        loop {
            if self.ch == '\0' && self.pos > self.input.len() {
                return Err(Error::Parse {
                    expected: format!("closing {}", quote),
                    found: "end of input".to_string(),
                    pos: token_pos,
                });
            }
            if self.ch == quote {
                if self.peek_char() == quote {
                    value.push(quote);
                    self.read_char();
                    self.read_char();
                    continue;
                }
                self.read_char();
                return Ok(value);
            }
            value.push(self.ch);
            self.read_char();
        }
    }
}

fn lookup_keyword(ident: &str) -> TokenType {
    KEYWORDS
        .get(ident.to_lowercase().as_str())
        .copied()
        .unwrap_or(TokenType::Ident)
}

fn is_ident_start(ch: char) -> bool {
    ch.is_alphabetic() || ch == '_'
}

pub fn tokenize(query: &str) -> Result<Vec<Token>> {
    let mut lexer = Lexer::new(query);
    let mut tokens = Vec::new();

    loop {
        let token = lexer.next_token()?;
        if token.token_type == TokenType::Illegal {
            return Err(Error::Parse {
                expected: "token".to_string(),
                found: token.value,
                pos: token.pos,
            });
        }
        let is_eof = token.token_type == TokenType::Eof;
        tokens.push(token);
        if is_eof {
            break;
        }
    }

    Ok(tokens)
}
