pub mod ast;
pub mod lexer;
pub mod parser;

pub use ast::*;
pub use lexer::{tokenize, Token, TokenType};
pub use parser::{parse, Parser};
