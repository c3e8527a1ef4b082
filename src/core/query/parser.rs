use super::ast::*;
use super::lexer::{tokenize, Token, TokenType};
use crate::core::errors::*;

/// Column a geodesic join compares when the query does not name one.
pub const DEFAULT_POINT_COLUMN: &str = "point";

/// Column a bare `CURVATURE` filter reads.
pub const DEFAULT_CURVATURE_COLUMN: &str = "curvature";

pub fn parse(query: &str) -> Result<Statement> {
    let tokens = tokenize(query)?;
    Parser::new(tokens).parse()
}

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    pub fn new(mut tokens: Vec<Token>) -> Self {
        if tokens.last().map(|t| t.token_type) != Some(TokenType::Eof) {
            let pos = tokens.last().map(|t| t.pos + t.value.len()).unwrap_or(0);
            tokens.push(Token {
                token_type: TokenType::Eof,
                value: String::new(),
                pos,
            });
        }
        Self { tokens, pos: 0 }
    }

    pub fn parse(&mut self) -> Result<Statement> {
        match self.current().token_type {
            TokenType::Select => Ok(Statement::Select(self.parse_select()?)),
            TokenType::Insert | TokenType::Update | TokenType::Delete => Err(Error::NotImplemented(
                format!("{} statements", self.current().value.to_uppercase()),
            )),
            TokenType::Eof => Err(self.error("statement")),
            _ => Err(Error::UnsupportedQuery(format!(
                "unknown statement starting with '{}'",
                self.current().value
            ))),
        }
    }

    fn parse_select(&mut self) -> Result<SelectStatement> {
        self.expect(TokenType::Select)?;
        let columns = self.parse_select_list()?;

        self.expect(TokenType::From)?;
        let from = self.parse_table_ref()?;

        let mut joins = Vec::new();
        while self.check(TokenType::Join) || self.check(TokenType::Inner) {
            joins.push(self.parse_join(&from)?);
        }

        let where_clause = if self.match_token(TokenType::Where) {
            Some(self.parse_condition()?)
        } else {
            None
        };

        let mut group_by = Vec::new();
        if self.match_token(TokenType::Group) {
            self.expect(TokenType::By)?;
            loop {
                group_by.push(self.parse_column_ref()?);
                if !self.match_token(TokenType::Comma) {
                    break;
                }
            }
        }

        let mut order_by = Vec::new();
        if self.match_token(TokenType::Order) {
            self.expect(TokenType::By)?;
            loop {
                let column = self.parse_column_ref()?;
                let descending = if self.match_token(TokenType::Desc) {
                    true
                } else {
                    self.match_token(TokenType::Asc);
                    false
                };
                order_by.push(OrderByItem { column, descending });
                if !self.match_token(TokenType::Comma) {
                    break;
                }
            }
        }

        let limit = if self.match_token(TokenType::Limit) {
            let token = self.expect(TokenType::Number)?;
            let limit = token.value.parse::<u64>().map_err(|_| Error::Parse {
                expected: "non-negative integer".to_string(),
                found: token.value.clone(),
                pos: token.pos,
            })?;
            Some(limit)
        } else {
            None
        };

        self.match_token(TokenType::Semicolon);
        if !self.is_at_end() {
            return Err(self.error("end of query"));
        }

        Ok(SelectStatement {
            columns,
            from,
            joins,
            where_clause,
            group_by,
            order_by,
            limit,
        })
    }

    fn parse_select_list(&mut self) -> Result<Vec<SelectItem>> {
        let mut items = Vec::new();
        loop {
            items.push(self.parse_select_item()?);
            if !self.match_token(TokenType::Comma) {
                break;
            }
        }
        Ok(items)
    }

    fn parse_select_item(&mut self) -> Result<SelectItem> {
        if self.match_token(TokenType::Star) {
            return Ok(SelectItem::Wildcard);
        }

        if self.check(TokenType::Ident) && self.peek_type(1) == TokenType::LParen {
            let name = self.current().clone();
            let function = AggregateFunction::from_name(&name.value).ok_or_else(|| {
                Error::UnsupportedQuery(format!("unknown function '{}'", name.value))
            })?;
            self.advance();
            self.expect(TokenType::LParen)?;

            let argument = if self.match_token(TokenType::Star) {
                if function != AggregateFunction::Count {
                    return Err(Error::Parse {
                        expected: "column".to_string(),
                        found: "*".to_string(),
                        pos: self.previous().pos,
                    });
                }
                None
            } else {
                Some(self.parse_column_ref()?)
            };
            self.expect(TokenType::RParen)?;

            return Ok(SelectItem::Aggregate { function, argument });
        }

        Ok(SelectItem::Column(self.parse_column_ref()?))
    }

    fn parse_table_ref(&mut self) -> Result<TableRef> {
        let name = self.expect(TokenType::Ident)?.value.clone();

        let alias = if self.match_token(TokenType::As) {
            Some(self.expect(TokenType::Ident)?.value.clone())
        } else if self.check(TokenType::Ident) {
            Some(self.advance().value.clone())
        } else {
            None
        };

        Ok(TableRef { name, alias })
    }

    fn parse_join(&mut self, from: &TableRef) -> Result<JoinClause> {
        self.match_token(TokenType::Inner);
        self.expect(TokenType::Join)?;
        let table = self.parse_table_ref()?;

        if self.match_token(TokenType::Using) {
            return Ok(JoinClause::Geodesic(self.parse_geodesic_join(from, table)?));
        }

        self.expect(TokenType::On)?;
        let on = self.parse_condition()?;
        Ok(JoinClause::Inner { table, on })
    }

    /// `USING GEODESIC_DISTANCE [(left, right)] <op> <threshold>`
    fn parse_geodesic_join(&mut self, from: &TableRef, table: TableRef) -> Result<GeodesicJoin> {
        self.expect(TokenType::GeodesicDistance)?;

        let (left_column, right_column) = if self.match_token(TokenType::LParen) {
            let left = self.parse_column_ref()?;
            self.expect(TokenType::Comma)?;
            let right = self.parse_column_ref()?;
            self.expect(TokenType::RParen)?;
            (left, right)
        } else {
            (
                ColumnRef::qualified(from.reference_name(), DEFAULT_POINT_COLUMN),
                ColumnRef::qualified(table.reference_name(), DEFAULT_POINT_COLUMN),
            )
        };

        let op = self.parse_comparison_op()?;
        let threshold = self.parse_number()?;

        Ok(GeodesicJoin {
            table,
            op,
            threshold,
            left_column,
            right_column,
        })
    }

    fn parse_condition(&mut self) -> Result<Condition> {
        let left = self.parse_operand()?;
        let op = self.parse_comparison_op()?;
        let right = self.parse_operand()?;
        Ok(Condition::new(left, op, right))
    }

    fn parse_operand(&mut self) -> Result<Operand> {
        match self.current().token_type {
            TokenType::Number => Ok(Operand::Number(self.parse_number()?)),
            TokenType::String => Ok(Operand::String(self.advance().value.clone())),
            TokenType::Ident => Ok(Operand::Column(self.parse_column_ref()?)),
            TokenType::GeodesicDistance => {
                self.advance();
                self.expect(TokenType::LParen)?;
                let column = self.parse_column_ref()?;
                self.expect(TokenType::Comma)?;
                let point = self.parse_point()?;
                self.expect(TokenType::RParen)?;
                Ok(Operand::GeodesicDistance { column, point })
            }
            TokenType::Curvature => {
                self.advance();
                if self.match_token(TokenType::LParen) {
                    let column = self.parse_column_ref()?;
                    self.expect(TokenType::RParen)?;
                    Ok(Operand::Curvature(column))
                } else {
                    Ok(Operand::Curvature(ColumnRef::new(DEFAULT_CURVATURE_COLUMN)))
                }
            }
            _ => Err(self.error("value")),
        }
    }

    /// `POINT(x, y, ...)`
    fn parse_point(&mut self) -> Result<Vec<f64>> {
        self.expect(TokenType::Point)?;
        self.expect(TokenType::LParen)?;
        let mut coords = Vec::new();
        loop {
            coords.push(self.parse_number()?);
            if !self.match_token(TokenType::Comma) {
                break;
            }
        }
        self.expect(TokenType::RParen)?;
        Ok(coords)
    }

    fn parse_column_ref(&mut self) -> Result<ColumnRef> {
        let first = self.expect_name()?;
        if self.match_token(TokenType::Dot) {
            let column = self.expect_name()?;
            return Ok(ColumnRef::qualified(first, column));
        }
        Ok(ColumnRef::new(first))
    }

    /// Identifiers, plus the function keywords that double as column names.
    fn expect_name(&mut self) -> Result<String> {
        match self.current().token_type {
            TokenType::Ident | TokenType::Curvature | TokenType::Point => {
                Ok(self.advance().value.clone())
            }
            _ => Err(self.error("column name")),
        }
    }

    fn parse_comparison_op(&mut self) -> Result<ComparisonOp> {
        let op = match self.current().token_type {
            TokenType::Eq => ComparisonOp::Eq,
            TokenType::NotEq => ComparisonOp::NotEq,
            TokenType::Lt => ComparisonOp::Lt,
            TokenType::Lte => ComparisonOp::Lte,
            TokenType::Gt => ComparisonOp::Gt,
            TokenType::Gte => ComparisonOp::Gte,
            _ => return Err(self.error("comparison operator")),
        };
        self.advance();
        Ok(op)
    }

    fn parse_number(&mut self) -> Result<f64> {
        let token = self.expect(TokenType::Number)?;
        token.value.parse::<f64>().map_err(|_| Error::Parse {
            expected: "number".to_string(),
            found: token.value.clone(),
            pos: token.pos,
        })
    }

    fn error(&self, expected: &str) -> Error {
        let token = self.current();
        Error::Parse {
            expected: expected.to_string(),
            found: token.describe(),
            pos: token.pos,
        }
    }

    fn expect(&mut self, token_type: TokenType) -> Result<&Token> {
        if self.check(token_type) {
            return Ok(self.advance());
        }
        Err(self.error(&token_type.to_string()))
    }

    fn current(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn previous(&self) -> &Token {
        &self.tokens[self.pos.saturating_sub(1)]
    }

    fn peek_type(&self, offset: usize) -> TokenType {
        self.tokens
            .get(self.pos + offset)
            .map(|t| t.token_type)
            .unwrap_or(TokenType::Eof)
    }

    fn advance(&mut self) -> &Token {
        if !self.is_at_end() {
            self.pos += 1;
        }
        self.previous()
    }

    fn check(&self, token_type: TokenType) -> bool {
        self.current().token_type == token_type
    }

    fn match_token(&mut self, token_type: TokenType) -> bool {
        if self.check(token_type) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn is_at_end(&self) -> bool {
        self.current().token_type == TokenType::Eof
    }
}
