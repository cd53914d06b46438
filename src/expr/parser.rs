//! Recursive descent parser producing the expression AST.
//!
//! Precedence, lowest first:
//!
//! ```text
//! ?:            conditional (right associative)
//! ||            logical or
//! &&            logical and
//! == != < <= > >= in
//! + -
//! * / %
//! ! -           unary
//! . [] ()       member, index, call
//! ```
//!
//! Both the recursion of the parser and the height of the tree it builds are
//! capped at [`MAX_DEPTH`], so the evaluator never recurses deeper either.

use super::lexer::{tokenize, SpannedToken, Token};
use super::ParseError;
use serde_json::Value;

/// Maximum nesting of an expression
pub const MAX_DEPTH: usize = 128;

/// Unary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

/// Binary operators other than the short-circuiting ones
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Eq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

impl BinaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Eq => "==",
            BinaryOp::NotEq => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::In => "in",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Rem => "%",
        }
    }
}

/// Expression AST
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Ident(String),
    Member(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Call {
        target: Option<Box<Expr>>,
        function: String,
        args: Vec<Expr>,
    },
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Conditional(Box<Expr>, Box<Expr>, Box<Expr>),
    List(Vec<Expr>),
    Map(Vec<(Expr, Expr)>),
}

/// Parse a complete expression.
pub fn parse(source: &str) -> Result<Expr, ParseError> {
    let tokens = tokenize(source)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        nesting: 0,
    };

    if parser.peek() == &Token::Eof {
        return Err(ParseError::Empty);
    }

    let expr = parser.conditional()?;
    parser.expect(Token::Eof)?;
    Ok(expr)
}

struct Parser {
    tokens: Vec<SpannedToken>,
    pos: usize,
    nesting: usize,
}

/// Height of an AST. Only called on trees already capped at `MAX_DEPTH`.
fn height(expr: &Expr) -> usize {
    let children = match expr {
        Expr::Literal(_) | Expr::Ident(_) => return 1,
        Expr::Member(inner, _) | Expr::Unary(_, inner) => height(inner),
        Expr::Index(a, b) | Expr::Binary(_, a, b) | Expr::And(a, b) | Expr::Or(a, b) => {
            height(a).max(height(b))
        }
        Expr::Conditional(a, b, c) => height(a).max(height(b)).max(height(c)),
        Expr::Call { target, args, .. } => target
            .iter()
            .map(|t| height(t))
            .chain(args.iter().map(height))
            .max()
            .unwrap_or(0),
        Expr::List(items) => items.iter().map(height).max().unwrap_or(0),
        Expr::Map(entries) => entries
            .iter()
            .map(|(k, v)| height(k).max(height(v)))
            .max()
            .unwrap_or(0),
    };
    children + 1
}

impl Parser {
    fn peek(&self) -> &Token {
        // tokenize always terminates the stream with Eof
        &self.tokens[self.pos.min(self.tokens.len() - 1)].token
    }

    fn position(&self) -> usize {
        self.tokens[self.pos.min(self.tokens.len() - 1)].start
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == token {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: Token) -> Result<(), ParseError> {
        if self.eat(&token) {
            Ok(())
        } else {
            Err(self.unexpected(&token.to_string()))
        }
    }

    fn too_deep(&self) -> ParseError {
        ParseError::TooDeep {
            limit: MAX_DEPTH,
            position: self.position(),
        }
    }

    /// Run `f` one recursion level deeper.
    fn nested<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T, ParseError>,
    ) -> Result<T, ParseError> {
        if self.nesting >= MAX_DEPTH {
            return Err(self.too_deep());
        }
        self.nesting += 1;
        let result = f(self);
        self.nesting -= 1;
        result
    }

    /// Check the height of a freshly built composite node.
    fn node(&self, expr: Expr) -> Result<Expr, ParseError> {
        if height(&expr) > MAX_DEPTH {
            return Err(self.too_deep());
        }
        Ok(expr)
    }

    fn unexpected(&self, expected: &str) -> ParseError {
        ParseError::UnexpectedToken {
            found: self.peek().to_string(),
            expected: expected.to_string(),
            position: self.position(),
        }
    }

    fn conditional(&mut self) -> Result<Expr, ParseError> {
        self.nested(|p| {
            let condition = p.or()?;
            if !p.eat(&Token::Question) {
                return Ok(condition);
            }
            let then = p.conditional()?;
            p.expect(Token::Colon)?;
            let otherwise = p.conditional()?;
            p.node(Expr::Conditional(
                Box::new(condition),
                Box::new(then),
                Box::new(otherwise),
            ))
        })
    }

    fn or(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.and()?;
        while self.eat(&Token::OrOr) {
            let right = self.and()?;
            left = self.node(Expr::Or(Box::new(left), Box::new(right)))?;
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.relation()?;
        while self.eat(&Token::AndAnd) {
            let right = self.relation()?;
            left = self.node(Expr::And(Box::new(left), Box::new(right)))?;
        }
        Ok(left)
    }

    fn relation(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.additive()?;
        loop {
            let op = match self.peek() {
                Token::EqEq => BinaryOp::Eq,
                Token::NotEq => BinaryOp::NotEq,
                Token::Lt => BinaryOp::Lt,
                Token::Le => BinaryOp::Le,
                Token::Gt => BinaryOp::Gt,
                Token::Ge => BinaryOp::Ge,
                Token::In => BinaryOp::In,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.additive()?;
            left = self.node(Expr::Binary(op, Box::new(left), Box::new(right)))?;
        }
    }

    fn additive(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.multiplicative()?;
        loop {
            let op = match self.peek() {
                Token::Plus => BinaryOp::Add,
                Token::Minus => BinaryOp::Sub,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.multiplicative()?;
            left = self.node(Expr::Binary(op, Box::new(left), Box::new(right)))?;
        }
    }

    fn multiplicative(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.unary()?;
        loop {
            let op = match self.peek() {
                Token::Star => BinaryOp::Mul,
                Token::Slash => BinaryOp::Div,
                Token::Percent => BinaryOp::Rem,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.unary()?;
            left = self.node(Expr::Binary(op, Box::new(left), Box::new(right)))?;
        }
    }

    fn unary(&mut self) -> Result<Expr, ParseError> {
        let op = if self.eat(&Token::Bang) {
            UnaryOp::Not
        } else if self.eat(&Token::Minus) {
            UnaryOp::Neg
        } else {
            return self.member();
        };
        let operand = self.nested(|p| p.unary())?;
        self.node(Expr::Unary(op, Box::new(operand)))
    }

    fn member(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.primary()?;
        loop {
            if self.eat(&Token::Dot) {
                let field = match self.peek() {
                    Token::Ident(name) => name.clone(),
                    // keywords are valid field names after a dot
                    Token::In | Token::True | Token::False | Token::Null => {
                        self.peek().to_string()
                    }
                    _ => return Err(self.unexpected("field name")),
                };
                self.advance();
                if self.eat(&Token::LParen) {
                    let args = self.arguments(Token::RParen)?;
                    expr = self.node(Expr::Call {
                        target: Some(Box::new(expr)),
                        function: field,
                        args,
                    })?;
                } else {
                    expr = self.node(Expr::Member(Box::new(expr), field))?;
                }
            } else if self.eat(&Token::LBracket) {
                let index = self.conditional()?;
                self.expect(Token::RBracket)?;
                expr = self.node(Expr::Index(Box::new(expr), Box::new(index)))?;
            } else {
                return Ok(expr);
            }
        }
    }

    fn primary(&mut self) -> Result<Expr, ParseError> {
        let token = self.peek().clone();
        match token {
            Token::Integer(n) => {
                self.advance();
                Ok(Expr::Literal(Value::from(n)))
            }
            Token::Float(n) => {
                self.advance();
                Ok(Expr::Literal(Value::from(n)))
            }
            Token::String(s) => {
                self.advance();
                Ok(Expr::Literal(Value::String(s)))
            }
            Token::True => {
                self.advance();
                Ok(Expr::Literal(Value::Bool(true)))
            }
            Token::False => {
                self.advance();
                Ok(Expr::Literal(Value::Bool(false)))
            }
            Token::Null => {
                self.advance();
                Ok(Expr::Literal(Value::Null))
            }
            Token::Ident(name) => {
                self.advance();
                if self.eat(&Token::LParen) {
                    let args = self.arguments(Token::RParen)?;
                    self.node(Expr::Call {
                        target: None,
                        function: name,
                        args,
                    })
                } else {
                    Ok(Expr::Ident(name))
                }
            }
            Token::LParen => {
                self.advance();
                let inner = self.conditional()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Token::LBracket => {
                self.advance();
                let items = self.arguments(Token::RBracket)?;
                self.node(Expr::List(items))
            }
            Token::LBrace => {
                self.advance();
                self.map_entries()
            }
            _ => Err(self.unexpected("expression")),
        }
    }

    /// Comma separated expressions up to `close`, which is consumed.
    fn arguments(&mut self, close: Token) -> Result<Vec<Expr>, ParseError> {
        let mut args = Vec::new();
        if self.eat(&close) {
            return Ok(args);
        }
        loop {
            args.push(self.conditional()?);
            if self.eat(&close) {
                return Ok(args);
            }
            self.expect(Token::Comma)?;
            // trailing comma
            if self.eat(&close) {
                return Ok(args);
            }
        }
    }

    fn map_entries(&mut self) -> Result<Expr, ParseError> {
        let mut entries = Vec::new();
        if self.eat(&Token::RBrace) {
            return self.node(Expr::Map(entries));
        }
        loop {
            let key = self.conditional()?;
            self.expect(Token::Colon)?;
            let value = self.conditional()?;
            entries.push((key, value));
            if self.eat(&Token::RBrace) {
                return self.node(Expr::Map(entries));
            }
            self.expect(Token::Comma)?;
            if self.eat(&Token::RBrace) {
                return self.node(Expr::Map(entries));
            }
        }
    }
}
