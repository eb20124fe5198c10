//! Path expression evaluation over parsed HTML documents.
//!
//! Covers the XPath 1.0 subset used for field queries: location paths over
//! every axis but `namespace`, name/`text()`/`node()` tests, predicates,
//! comparisons, arithmetic, unions and the core string, number and node-set
//! functions.

use std::collections::HashMap;

use ego_tree::{NodeId, NodeRef};
use scraper::node::Node;
use scraper::Html;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message} at offset {offset}")]
pub(crate) struct PathSyntaxError {
    pub offset: usize,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("type error: {0}")]
pub(crate) struct EvalError(String);

/// A parsed path expression.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PathExpression {
    expr: Expr,
}

impl PathExpression {
    pub(crate) fn parse(source: &str) -> Result<Self, PathSyntaxError> {
        let tokens = tokenize(source)?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            end: source.len(),
        };
        let expr = parser.parse_expr()?;
        if parser.pos < parser.tokens.len() {
            return Err(parser.error("unexpected token"));
        }
        Ok(Self { expr })
    }

    /// Evaluate against `document`. Every match becomes its string value:
    /// element text content keeps its whitespace, like text and attribute matches.
    pub(crate) fn select_text(&self, document: &Evaluator<'_>) -> Result<Vec<String>, EvalError> {
        let ctx = Ctx {
            item: Item::Node(document.root),
            position: 1,
            size: 1,
        };
        Ok(match document.eval(&self.expr, &ctx)? {
            Value::Nodes(items) => items.iter().map(string_value).collect(),
            other => vec![to_string(&other)],
        })
    }
}

// ---------------------------------------------------------------------------
// Lexer

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Slash,
    DoubleSlash,
    LBracket,
    RBracket,
    LParen,
    RParen,
    At,
    Comma,
    Pipe,
    Dot,
    DotDot,
    Star,
    ColonColon,
    Plus,
    Minus,
    Op(CmpOp),
    Name(String),
    Literal(String),
    Number(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

impl CmpOp {
    fn flip(self) -> Self {
        match self {
            CmpOp::Lt => CmpOp::Gt,
            CmpOp::Le => CmpOp::Ge,
            CmpOp::Gt => CmpOp::Lt,
            CmpOp::Ge => CmpOp::Le,
            other => other,
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<(usize, Token)>, PathSyntaxError> {
    let chars: Vec<(usize, char)> = input.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    let error = |offset: usize, message: &str| PathSyntaxError {
        offset,
        message: message.to_string(),
    };

    while i < chars.len() {
        let (offset, c) = chars[i];
        let next = chars.get(i + 1).map(|(_, c)| *c);
        let token = match c {
            c if c.is_whitespace() => {
                i += 1;
                continue;
            }
            '/' if next == Some('/') => {
                i += 2;
                Token::DoubleSlash
            }
            '.' if next == Some('.') => {
                i += 2;
                Token::DotDot
            }
            ':' if next == Some(':') => {
                i += 2;
                Token::ColonColon
            }
            '!' if next == Some('=') => {
                i += 2;
                Token::Op(CmpOp::Ne)
            }
            '<' if next == Some('=') => {
                i += 2;
                Token::Op(CmpOp::Le)
            }
            '>' if next == Some('=') => {
                i += 2;
                Token::Op(CmpOp::Ge)
            }
            '"' | '\'' => {
                let start = i + 1;
                let mut end = start;
                while end < chars.len() && chars[end].1 != c {
                    end += 1;
                }
                if end >= chars.len() {
                    return Err(error(offset, "unterminated string literal"));
                }
                let literal = chars[start..end].iter().map(|(_, c)| *c).collect();
                i = end + 1;
                Token::Literal(literal)
            }
            c if c.is_ascii_digit() || (c == '.' && next.is_some_and(|n| n.is_ascii_digit())) => {
                let mut end = i;
                let mut seen_dot = false;
                while end < chars.len() {
                    let d = chars[end].1;
                    if d == '.' && !seen_dot {
                        seen_dot = true;
                    } else if !d.is_ascii_digit() {
                        break;
                    }
                    end += 1;
                }
                let text: String = chars[i..end].iter().map(|(_, c)| *c).collect();
                let number = text
                    .parse::<f64>()
                    .map_err(|_| error(offset, "invalid number"))?;
                i = end;
                Token::Number(number)
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut end = i;
                while end < chars.len() {
                    let d = chars[end].1;
                    if d.is_alphanumeric() || matches!(d, '_' | '-' | '.') {
                        end += 1;
                    } else {
                        break;
                    }
                }
                let name = chars[i..end].iter().map(|(_, c)| *c).collect();
                i = end;
                Token::Name(name)
            }
            _ => {
                i += 1;
                match c {
                    '/' => Token::Slash,
                    '.' => Token::Dot,
                    '[' => Token::LBracket,
                    ']' => Token::RBracket,
                    '(' => Token::LParen,
                    ')' => Token::RParen,
                    '@' => Token::At,
                    ',' => Token::Comma,
                    '|' => Token::Pipe,
                    '*' => Token::Star,
                    '+' => Token::Plus,
                    '-' => Token::Minus,
                    '=' => Token::Op(CmpOp::Eq),
                    '<' => Token::Op(CmpOp::Lt),
                    '>' => Token::Op(CmpOp::Gt),
                    _ => return Err(error(offset, &format!("unexpected character `{c}`"))),
                }
            }
        };
        tokens.push((offset, token));
    }
    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Syntax tree and parser

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Path(LocationPath),
    Filter {
        primary: Box<Expr>,
        predicates: Vec<Expr>,
        steps: Vec<Step>,
    },
    Union(Vec<Expr>),
    Literal(String),
    Number(f64),
    Call(Function, Vec<Expr>),
    Compare(Box<Expr>, CmpOp, Box<Expr>),
    Arith(Box<Expr>, ArithOp, Box<Expr>),
    Negate(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
struct LocationPath {
    absolute: bool,
    steps: Vec<Step>,
}

#[derive(Debug, Clone, PartialEq)]
struct Step {
    axis: Axis,
    test: NodeTest,
    predicates: Vec<Expr>,
}

impl Step {
    fn descendant_or_self() -> Self {
        Step {
            axis: Axis::DescendantOrSelf,
            test: NodeTest::Node,
            predicates: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Axis {
    Child,
    Descendant,
    DescendantOrSelf,
    SelfNode,
    Parent,
    Ancestor,
    AncestorOrSelf,
    Attribute,
    Following,
    FollowingSibling,
    Preceding,
    PrecedingSibling,
}

impl Axis {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "child" => Axis::Child,
            "descendant" => Axis::Descendant,
            "descendant-or-self" => Axis::DescendantOrSelf,
            "self" => Axis::SelfNode,
            "parent" => Axis::Parent,
            "ancestor" => Axis::Ancestor,
            "ancestor-or-self" => Axis::AncestorOrSelf,
            "attribute" => Axis::Attribute,
            "following" => Axis::Following,
            "following-sibling" => Axis::FollowingSibling,
            "preceding" => Axis::Preceding,
            "preceding-sibling" => Axis::PrecedingSibling,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum NodeTest {
    Name(String),
    Wildcard,
    Text,
    Comment,
    Node,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Function {
    Last,
    Position,
    Count,
    Contains,
    StartsWith,
    NormalizeSpace,
    String,
    StringLength,
    Concat,
    Substring,
    SubstringBefore,
    SubstringAfter,
    Translate,
    LocalName,
    Name,
    Number,
    Sum,
    Floor,
    Ceiling,
    Round,
    Boolean,
    Not,
    True,
    False,
}

impl Function {
    fn lookup(name: &str) -> Option<Self> {
        Some(match name {
            "last" => Function::Last,
            "position" => Function::Position,
            "count" => Function::Count,
            "contains" => Function::Contains,
            "starts-with" => Function::StartsWith,
            "normalize-space" => Function::NormalizeSpace,
            "string" => Function::String,
            "string-length" => Function::StringLength,
            "concat" => Function::Concat,
            "substring" => Function::Substring,
            "substring-before" => Function::SubstringBefore,
            "substring-after" => Function::SubstringAfter,
            "translate" => Function::Translate,
            "local-name" => Function::LocalName,
            "name" => Function::Name,
            "number" => Function::Number,
            "sum" => Function::Sum,
            "floor" => Function::Floor,
            "ceiling" => Function::Ceiling,
            "round" => Function::Round,
            "boolean" => Function::Boolean,
            "not" => Function::Not,
            "true" => Function::True,
            "false" => Function::False,
            _ => return None,
        })
    }

    fn accepts(self, arity: usize) -> bool {
        match self {
            Function::Last | Function::Position | Function::True | Function::False => arity == 0,
            Function::Count
            | Function::Not
            | Function::Sum
            | Function::Floor
            | Function::Ceiling
            | Function::Round
            | Function::Boolean => arity == 1,
            Function::Contains
            | Function::StartsWith
            | Function::SubstringBefore
            | Function::SubstringAfter => arity == 2,
            Function::Substring => arity == 2 || arity == 3,
            Function::Translate => arity == 3,
            Function::NormalizeSpace
            | Function::String
            | Function::StringLength
            | Function::LocalName
            | Function::Name
            | Function::Number => arity <= 1,
            Function::Concat => arity >= 2,
        }
    }
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    end: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.peek_at(0)
    }

    fn peek_at(&self, ahead: usize) -> Option<&Token> {
        self.tokens.get(self.pos + ahead).map(|(_, token)| token)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(_, token)| token.clone());
        self.pos += 1;
        token
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: Token, what: &str) -> Result<(), PathSyntaxError> {
        if self.eat(&expected) {
            Ok(())
        } else {
            Err(self.error(&format!("expected {what}")))
        }
    }

    fn error(&self, message: &str) -> PathSyntaxError {
        let offset = self
            .tokens
            .get(self.pos)
            .map(|(offset, _)| *offset)
            .unwrap_or(self.end);
        PathSyntaxError {
            offset,
            message: message.to_string(),
        }
    }

    fn peek_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Some(Token::Name(name)) if name == keyword)
    }

    fn parse_expr(&mut self) -> Result<Expr, PathSyntaxError> {
        let mut left = self.parse_and()?;
        while self.peek_keyword("or") {
            self.pos += 1;
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, PathSyntaxError> {
        let mut left = self.parse_equality()?;
        while self.peek_keyword("and") {
            self.pos += 1;
            let right = self.parse_equality()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_equality(&mut self) -> Result<Expr, PathSyntaxError> {
        let mut left = self.parse_relational()?;
        while let Some(Token::Op(op @ (CmpOp::Eq | CmpOp::Ne))) = self.peek() {
            let op = *op;
            self.pos += 1;
            let right = self.parse_relational()?;
            left = Expr::Compare(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn parse_relational(&mut self) -> Result<Expr, PathSyntaxError> {
        let mut left = self.parse_additive()?;
        while let Some(Token::Op(op @ (CmpOp::Lt | CmpOp::Le | CmpOp::Gt | CmpOp::Ge))) =
            self.peek()
        {
            let op = *op;
            self.pos += 1;
            let right = self.parse_additive()?;
            left = Expr::Compare(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn parse_additive(&mut self) -> Result<Expr, PathSyntaxError> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => ArithOp::Add,
                Some(Token::Minus) => ArithOp::Sub,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.parse_multiplicative()?;
            left = Expr::Arith(Box::new(left), op, Box::new(right));
        }
    }

    /// After a complete operand, `*`, `div` and `mod` are operators, never name tests.
    fn parse_multiplicative(&mut self) -> Result<Expr, PathSyntaxError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => ArithOp::Mul,
                Some(Token::Name(name)) if name == "div" => ArithOp::Div,
                Some(Token::Name(name)) if name == "mod" => ArithOp::Mod,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Expr::Arith(Box::new(left), op, Box::new(right));
        }
    }

    fn parse_unary(&mut self) -> Result<Expr, PathSyntaxError> {
        if self.eat(&Token::Minus) {
            let operand = self.parse_unary()?;
            return Ok(Expr::Negate(Box::new(operand)));
        }
        self.parse_union()
    }

    fn parse_union(&mut self) -> Result<Expr, PathSyntaxError> {
        let first = self.parse_path_expr()?;
        if self.peek() != Some(&Token::Pipe) {
            return Ok(first);
        }
        let mut parts = vec![first];
        while self.eat(&Token::Pipe) {
            parts.push(self.parse_path_expr()?);
        }
        Ok(Expr::Union(parts))
    }

    fn parse_path_expr(&mut self) -> Result<Expr, PathSyntaxError> {
        match self.peek() {
            Some(Token::Literal(_)) | Some(Token::Number(_)) => match self.advance() {
                Some(Token::Literal(text)) => Ok(Expr::Literal(text)),
                Some(Token::Number(n)) => Ok(Expr::Number(n)),
                _ => Err(self.error("expected literal")),
            },
            Some(Token::LParen) => {
                self.pos += 1;
                let inner = self.parse_expr()?;
                self.expect(Token::RParen, "`)`")?;
                self.parse_filter_tail(inner)
            }
            Some(Token::Name(name))
                if self.peek_at(1) == Some(&Token::LParen)
                    && !matches!(name.as_str(), "text" | "node" | "comment") =>
            {
                let call = self.parse_call()?;
                self.parse_filter_tail(call)
            }
            Some(Token::Slash) => {
                self.pos += 1;
                let mut steps = Vec::new();
                if self.peek().is_some_and(starts_step) {
                    self.parse_relative(&mut steps)?;
                }
                Ok(Expr::Path(LocationPath {
                    absolute: true,
                    steps,
                }))
            }
            Some(Token::DoubleSlash) => {
                self.pos += 1;
                let mut steps = vec![Step::descendant_or_self()];
                self.parse_relative(&mut steps)?;
                Ok(Expr::Path(LocationPath {
                    absolute: true,
                    steps,
                }))
            }
            Some(token) if starts_step(token) => {
                let mut steps = Vec::new();
                self.parse_relative(&mut steps)?;
                Ok(Expr::Path(LocationPath {
                    absolute: false,
                    steps,
                }))
            }
            _ => Err(self.error("expected expression")),
        }
    }

    fn parse_call(&mut self) -> Result<Expr, PathSyntaxError> {
        let name = match self.advance() {
            Some(Token::Name(name)) => name,
            _ => return Err(self.error("expected function name")),
        };
        let function = Function::lookup(&name).ok_or_else(|| PathSyntaxError {
            offset: self.tokens[self.pos - 1].0,
            message: format!("unknown function `{name}()`"),
        })?;
        self.expect(Token::LParen, "`(`")?;
        let mut args = Vec::new();
        if !self.eat(&Token::RParen) {
            loop {
                args.push(self.parse_expr()?);
                if self.eat(&Token::Comma) {
                    continue;
                }
                self.expect(Token::RParen, "`)`")?;
                break;
            }
        }
        if !function.accepts(args.len()) {
            return Err(self.error(&format!(
                "wrong number of arguments ({}) for `{name}()`",
                args.len()
            )));
        }
        Ok(Expr::Call(function, args))
    }

    fn parse_filter_tail(&mut self, primary: Expr) -> Result<Expr, PathSyntaxError> {
        let predicates = self.parse_predicates()?;
        let mut steps = Vec::new();
        match self.peek() {
            Some(Token::Slash) => {
                self.pos += 1;
                self.parse_relative(&mut steps)?;
            }
            Some(Token::DoubleSlash) => {
                self.pos += 1;
                steps.push(Step::descendant_or_self());
                self.parse_relative(&mut steps)?;
            }
            _ => {}
        }
        if predicates.is_empty() && steps.is_empty() {
            return Ok(primary);
        }
        Ok(Expr::Filter {
            primary: Box::new(primary),
            predicates,
            steps,
        })
    }

    fn parse_relative(&mut self, steps: &mut Vec<Step>) -> Result<(), PathSyntaxError> {
        loop {
            steps.push(self.parse_step()?);
            match self.peek() {
                Some(Token::Slash) => self.pos += 1,
                Some(Token::DoubleSlash) => {
                    self.pos += 1;
                    steps.push(Step::descendant_or_self());
                }
                _ => return Ok(()),
            }
        }
    }

    fn parse_step(&mut self) -> Result<Step, PathSyntaxError> {
        if self.eat(&Token::Dot) {
            return Ok(Step {
                axis: Axis::SelfNode,
                test: NodeTest::Node,
                predicates: self.parse_predicates()?,
            });
        }
        if self.eat(&Token::DotDot) {
            return Ok(Step {
                axis: Axis::Parent,
                test: NodeTest::Node,
                predicates: self.parse_predicates()?,
            });
        }

        let axis = if self.eat(&Token::At) {
            Axis::Attribute
        } else if self.peek_at(1) == Some(&Token::ColonColon) {
            let name = match self.advance() {
                Some(Token::Name(name)) => name,
                _ => return Err(self.error("expected axis name")),
            };
            self.pos += 1;
            Axis::from_name(&name).ok_or_else(|| PathSyntaxError {
                offset: self.tokens[self.pos - 2].0,
                message: format!("unsupported axis `{name}`"),
            })?
        } else {
            Axis::Child
        };

        let test = match self.advance() {
            Some(Token::Star) => NodeTest::Wildcard,
            Some(Token::Name(name)) if self.peek() == Some(&Token::LParen) => {
                let test = match name.as_str() {
                    "text" => NodeTest::Text,
                    "node" => NodeTest::Node,
                    "comment" => NodeTest::Comment,
                    _ => {
                        self.pos -= 1;
                        return Err(self.error(&format!("`{name}()` is not a node test")));
                    }
                };
                self.pos += 1;
                self.expect(Token::RParen, "`)`")?;
                test
            }
            Some(Token::Name(name)) => NodeTest::Name(name),
            _ => {
                self.pos = self.pos.saturating_sub(1);
                return Err(self.error("expected node test"));
            }
        };

        Ok(Step {
            axis,
            test,
            predicates: self.parse_predicates()?,
        })
    }

    fn parse_predicates(&mut self) -> Result<Vec<Expr>, PathSyntaxError> {
        let mut predicates = Vec::new();
        while self.eat(&Token::LBracket) {
            predicates.push(self.parse_expr()?);
            self.expect(Token::RBracket, "`]`")?;
        }
        Ok(predicates)
    }
}

fn starts_step(token: &Token) -> bool {
    matches!(
        token,
        Token::Dot | Token::DotDot | Token::At | Token::Star | Token::Name(_)
    )
}

// ---------------------------------------------------------------------------
// Evaluation

#[derive(Debug, Clone, Copy)]
enum Item<'a> {
    Node(NodeRef<'a, Node>),
    Attr {
        owner: NodeRef<'a, Node>,
        index: usize,
        name: &'a str,
        value: &'a str,
    },
}

enum Value<'a> {
    Nodes(Vec<Item<'a>>),
    Str(String),
    Num(f64),
    Bool(bool),
}

struct Ctx<'a> {
    item: Item<'a>,
    position: usize,
    size: usize,
}

/// A parsed document indexed for document-order sorting; reused across the
/// fields evaluated against one page.
pub(crate) struct Evaluator<'a> {
    root: NodeRef<'a, Node>,
    order: HashMap<NodeId, usize>,
}

impl<'a> Evaluator<'a> {
    pub(crate) fn new(document: &'a Html) -> Self {
        let root = document.tree.root();
        let order = root
            .descendants()
            .enumerate()
            .map(|(index, node)| (node.id(), index))
            .collect();
        Self { root, order }
    }

    fn sort_key(&self, item: &Item<'a>) -> (usize, usize) {
        match item {
            Item::Node(node) => (self.order.get(&node.id()).copied().unwrap_or(0), 0),
            Item::Attr { owner, index, .. } => (
                self.order.get(&owner.id()).copied().unwrap_or(0),
                index + 1,
            ),
        }
    }

    /// Sort into document order and drop duplicates.
    fn normalize(&self, mut items: Vec<Item<'a>>) -> Vec<Item<'a>> {
        items.sort_by_key(|item| self.sort_key(item));
        items.dedup_by_key(|item| self.sort_key(item));
        items
    }

    fn eval(&self, expr: &Expr, ctx: &Ctx<'a>) -> Result<Value<'a>, EvalError> {
        match expr {
            Expr::Path(path) => {
                let start = if path.absolute {
                    Item::Node(self.root)
                } else {
                    ctx.item
                };
                Ok(Value::Nodes(self.apply_steps(vec![start], &path.steps)?))
            }
            Expr::Filter {
                primary,
                predicates,
                steps,
            } => {
                let items = match self.eval(primary, ctx)? {
                    Value::Nodes(items) => items,
                    _ => {
                        return Err(EvalError(
                            "predicates and steps need a node-set".to_string(),
                        ))
                    }
                };
                let items = self.filter(items, predicates)?;
                Ok(Value::Nodes(self.apply_steps(items, steps)?))
            }
            Expr::Union(parts) => {
                let mut items = Vec::new();
                for part in parts {
                    match self.eval(part, ctx)? {
                        Value::Nodes(found) => items.extend(found),
                        _ => return Err(EvalError("union operands must be node-sets".to_string())),
                    }
                }
                Ok(Value::Nodes(self.normalize(items)))
            }
            Expr::Literal(text) => Ok(Value::Str(text.clone())),
            Expr::Number(n) => Ok(Value::Num(*n)),
            Expr::Call(function, args) => self.call(*function, args, ctx),
            Expr::Compare(left, op, right) => {
                let left = self.eval(left, ctx)?;
                let right = self.eval(right, ctx)?;
                Ok(Value::Bool(compare(&left, *op, &right)))
            }
            Expr::Arith(left, op, right) => {
                let a = to_number(&self.eval(left, ctx)?);
                let b = to_number(&self.eval(right, ctx)?);
                Ok(Value::Num(match op {
                    ArithOp::Add => a + b,
                    ArithOp::Sub => a - b,
                    ArithOp::Mul => a * b,
                    ArithOp::Div => a / b,
                    // Truncating remainder, the sign follows the dividend.
                    ArithOp::Mod => a % b,
                }))
            }
            Expr::Negate(operand) => Ok(Value::Num(-to_number(&self.eval(operand, ctx)?))),
            Expr::And(left, right) => {
                let result =
                    to_bool(&self.eval(left, ctx)?) && to_bool(&self.eval(right, ctx)?);
                Ok(Value::Bool(result))
            }
            Expr::Or(left, right) => {
                let result =
                    to_bool(&self.eval(left, ctx)?) || to_bool(&self.eval(right, ctx)?);
                Ok(Value::Bool(result))
            }
        }
    }

    fn apply_steps(
        &self,
        mut current: Vec<Item<'a>>,
        steps: &[Step],
    ) -> Result<Vec<Item<'a>>, EvalError> {
        for step in steps {
            let mut next = Vec::new();
            for item in &current {
                let candidates = axis_items(*item, step.axis)
                    .into_iter()
                    .filter(|candidate| matches_test(&step.test, candidate, step.axis))
                    .collect();
                next.extend(self.filter(candidates, &step.predicates)?);
            }
            current = self.normalize(next);
        }
        Ok(current)
    }

    fn filter(
        &self,
        mut items: Vec<Item<'a>>,
        predicates: &[Expr],
    ) -> Result<Vec<Item<'a>>, EvalError> {
        for predicate in predicates {
            let size = items.len();
            let mut kept = Vec::with_capacity(size);
            for (index, item) in items.into_iter().enumerate() {
                let ctx = Ctx {
                    item,
                    position: index + 1,
                    size,
                };
                let keep = match self.eval(predicate, &ctx)? {
                    Value::Num(n) => n == (index + 1) as f64,
                    other => to_bool(&other),
                };
                if keep {
                    kept.push(item);
                }
            }
            items = kept;
        }
        Ok(items)
    }

    fn call(
        &self,
        function: Function,
        args: &[Expr],
        ctx: &Ctx<'a>,
    ) -> Result<Value<'a>, EvalError> {
        let arg = |index: usize| -> Result<Value<'a>, EvalError> {
            let expr = args
                .get(index)
                .ok_or_else(|| EvalError(format!("missing argument {}", index + 1)))?;
            self.eval(expr, ctx)
        };
        let string_or_context = |args: &[Expr]| -> Result<String, EvalError> {
            if args.is_empty() {
                Ok(string_value(&ctx.item))
            } else {
                Ok(to_string(&arg(0)?))
            }
        };
        let nodes = |name: &str| -> Result<Vec<Item<'a>>, EvalError> {
            match arg(0)? {
                Value::Nodes(items) => Ok(items),
                _ => Err(EvalError(format!("{name}() expects a node-set"))),
            }
        };
        let first_or_context = |name: &str| -> Result<Option<Item<'a>>, EvalError> {
            if args.is_empty() {
                Ok(Some(ctx.item))
            } else {
                Ok(nodes(name)?.first().copied())
            }
        };

        Ok(match function {
            Function::Last => Value::Num(ctx.size as f64),
            Function::Position => Value::Num(ctx.position as f64),
            Function::Count => Value::Num(nodes("count")?.len() as f64),
            Function::Sum => Value::Num(
                nodes("sum")?
                    .iter()
                    .map(|item| parse_number(&string_value(item)))
                    .sum(),
            ),
            Function::Contains => {
                Value::Bool(to_string(&arg(0)?).contains(&to_string(&arg(1)?)))
            }
            Function::StartsWith => {
                Value::Bool(to_string(&arg(0)?).starts_with(&to_string(&arg(1)?)))
            }
            Function::NormalizeSpace => Value::Str(
                string_or_context(args)?
                    .split_whitespace()
                    .collect::<Vec<_>>()
                    .join(" "),
            ),
            Function::String => Value::Str(string_or_context(args)?),
            Function::StringLength => Value::Num(string_or_context(args)?.chars().count() as f64),
            Function::Concat => {
                let mut joined = String::new();
                for index in 0..args.len() {
                    joined.push_str(&to_string(&arg(index)?));
                }
                Value::Str(joined)
            }
            Function::Substring => {
                let text = to_string(&arg(0)?);
                let start = round_half_up(to_number(&arg(1)?));
                let end = if args.len() > 2 {
                    start + round_half_up(to_number(&arg(2)?))
                } else {
                    f64::INFINITY
                };
                // Positions are 1-based; NaN bounds select nothing.
                Value::Str(
                    text.chars()
                        .enumerate()
                        .filter(|(index, _)| {
                            let position = (index + 1) as f64;
                            position >= start && position < end
                        })
                        .map(|(_, c)| c)
                        .collect(),
                )
            }
            Function::SubstringBefore => {
                let text = to_string(&arg(0)?);
                let needle = to_string(&arg(1)?);
                Value::Str(
                    text.find(needle.as_str())
                        .map(|at| text[..at].to_string())
                        .unwrap_or_default(),
                )
            }
            Function::SubstringAfter => {
                let text = to_string(&arg(0)?);
                let needle = to_string(&arg(1)?);
                Value::Str(
                    text.find(needle.as_str())
                        .map(|at| text[at + needle.len()..].to_string())
                        .unwrap_or_default(),
                )
            }
            Function::Translate => {
                let text = to_string(&arg(0)?);
                let from: Vec<char> = to_string(&arg(1)?).chars().collect();
                let to: Vec<char> = to_string(&arg(2)?).chars().collect();
                Value::Str(
                    text.chars()
                        .filter_map(|c| match from.iter().position(|candidate| *candidate == c) {
                            Some(index) => to.get(index).copied(),
                            None => Some(c),
                        })
                        .collect(),
                )
            }
            Function::LocalName | Function::Name => Value::Str(
                first_or_context("name")?
                    .map(|item| node_name(&item))
                    .unwrap_or_default(),
            ),
            Function::Number => {
                if args.is_empty() {
                    Value::Num(parse_number(&string_value(&ctx.item)))
                } else {
                    Value::Num(to_number(&arg(0)?))
                }
            }
            Function::Floor => Value::Num(to_number(&arg(0)?).floor()),
            Function::Ceiling => Value::Num(to_number(&arg(0)?).ceil()),
            Function::Round => Value::Num(round_half_up(to_number(&arg(0)?))),
            Function::Boolean => Value::Bool(to_bool(&arg(0)?)),
            Function::Not => Value::Bool(!to_bool(&arg(0)?)),
            Function::True => Value::Bool(true),
            Function::False => Value::Bool(false),
        })
    }
}

fn axis_items<'a>(item: Item<'a>, axis: Axis) -> Vec<Item<'a>> {
    let node = match (axis, item) {
        (Axis::SelfNode, _) => return vec![item],
        (Axis::Parent, Item::Attr { owner, .. }) => return vec![Item::Node(owner)],
        (Axis::Ancestor, Item::Attr { owner, .. }) => {
            return std::iter::once(owner)
                .chain(owner.ancestors())
                .map(Item::Node)
                .collect()
        }
        (Axis::AncestorOrSelf, Item::Attr { owner, .. }) => {
            return std::iter::once(item)
                .chain(std::iter::once(owner).chain(owner.ancestors()).map(Item::Node))
                .collect()
        }
        (Axis::Following, Item::Attr { owner, .. }) => {
            return owner
                .descendants()
                .skip(1)
                .map(Item::Node)
                .chain(following(owner))
                .collect()
        }
        (Axis::Preceding, Item::Attr { owner, .. }) => return preceding(owner),
        (_, Item::Attr { .. }) => return Vec::new(),
        (_, Item::Node(node)) => node,
    };

    match axis {
        Axis::Child => node.children().map(Item::Node).collect(),
        Axis::Descendant => node.descendants().skip(1).map(Item::Node).collect(),
        Axis::DescendantOrSelf => node.descendants().map(Item::Node).collect(),
        Axis::Parent => node.parent().map(Item::Node).into_iter().collect(),
        Axis::Ancestor => node.ancestors().map(Item::Node).collect(),
        Axis::AncestorOrSelf => std::iter::once(node)
            .chain(node.ancestors())
            .map(Item::Node)
            .collect(),
        Axis::Following => following(node),
        Axis::Preceding => preceding(node),
        Axis::FollowingSibling => node.next_siblings().map(Item::Node).collect(),
        Axis::PrecedingSibling => node.prev_siblings().map(Item::Node).collect(),
        Axis::Attribute => match node.value() {
            Node::Element(element) => element
                .attrs()
                .enumerate()
                .map(|(index, (name, value))| Item::Attr {
                    owner: node,
                    index,
                    name,
                    value,
                })
                .collect(),
            _ => Vec::new(),
        },
        Axis::SelfNode => vec![Item::Node(node)],
    }
}

/// Everything after `node` in document order, minus its descendants.
fn following<'a>(node: NodeRef<'a, Node>) -> Vec<Item<'a>> {
    std::iter::once(node)
        .chain(node.ancestors())
        .flat_map(|anchor| anchor.next_siblings())
        .flat_map(|sibling| sibling.descendants())
        .map(Item::Node)
        .collect()
}

/// Everything before `node` minus its ancestors, nearest first so that
/// positional predicates count backwards.
fn preceding<'a>(node: NodeRef<'a, Node>) -> Vec<Item<'a>> {
    let mut items = Vec::new();
    for anchor in std::iter::once(node).chain(node.ancestors()) {
        for sibling in anchor.prev_siblings() {
            let subtree: Vec<_> = sibling.descendants().collect();
            items.extend(subtree.into_iter().rev().map(Item::Node));
        }
    }
    items
}

fn matches_test(test: &NodeTest, item: &Item<'_>, axis: Axis) -> bool {
    match item {
        Item::Attr { name, .. } => match test {
            NodeTest::Node | NodeTest::Wildcard => true,
            NodeTest::Name(expected) => name.eq_ignore_ascii_case(expected),
            NodeTest::Text | NodeTest::Comment => false,
        },
        Item::Node(node) => match (test, node.value()) {
            (NodeTest::Node, _) => true,
            (NodeTest::Text, Node::Text(_)) => true,
            (NodeTest::Comment, Node::Comment(_)) => true,
            (NodeTest::Wildcard, Node::Element(_)) => axis != Axis::Attribute,
            (NodeTest::Name(expected), Node::Element(element)) => {
                element.name().eq_ignore_ascii_case(expected)
            }
            _ => false,
        },
    }
}

fn string_value(item: &Item<'_>) -> String {
    match item {
        Item::Attr { value, .. } => value.to_string(),
        Item::Node(node) => match node.value() {
            Node::Text(text) => text.to_string(),
            Node::Comment(comment) => comment.to_string(),
            Node::Element(_) | Node::Document | Node::Fragment => node
                .descendants()
                .filter_map(|descendant| match descendant.value() {
                    Node::Text(text) => Some(&**text),
                    _ => None,
                })
                .collect(),
            _ => String::new(),
        },
    }
}

fn node_name(item: &Item<'_>) -> String {
    match item {
        Item::Attr { name, .. } => name.to_string(),
        Item::Node(node) => match node.value() {
            Node::Element(element) => element.name().to_string(),
            _ => String::new(),
        },
    }
}

fn to_string(value: &Value<'_>) -> String {
    match value {
        Value::Nodes(items) => items.first().map(string_value).unwrap_or_default(),
        Value::Str(text) => text.clone(),
        Value::Num(n) => format_number(*n),
        Value::Bool(b) => b.to_string(),
    }
}

fn format_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.is_infinite() {
        let sign = if n > 0.0 { "" } else { "-" };
        format!("{sign}Infinity")
    } else if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

fn to_number(value: &Value<'_>) -> f64 {
    match value {
        Value::Num(n) => *n,
        Value::Bool(b) => f64::from(u8::from(*b)),
        other => parse_number(&to_string(other)),
    }
}

/// Strict XPath number syntax: optional minus, digits with at most one point.
fn parse_number(text: &str) -> f64 {
    let trimmed = text.trim();
    let unsigned = trimmed.strip_prefix('-').unwrap_or(trimmed);
    let well_formed = unsigned.chars().any(|c| c.is_ascii_digit())
        && unsigned.chars().all(|c| c.is_ascii_digit() || c == '.')
        && unsigned.matches('.').count() <= 1;
    if well_formed {
        trimmed.parse().unwrap_or(f64::NAN)
    } else {
        f64::NAN
    }
}

fn round_half_up(n: f64) -> f64 {
    if n.is_finite() {
        (n + 0.5).floor()
    } else {
        n
    }
}

fn to_bool(value: &Value<'_>) -> bool {
    match value {
        Value::Nodes(items) => !items.is_empty(),
        Value::Str(text) => !text.is_empty(),
        Value::Num(n) => *n != 0.0 && !n.is_nan(),
        Value::Bool(b) => *b,
    }
}

fn compare(left: &Value<'_>, op: CmpOp, right: &Value<'_>) -> bool {
    match (left, right) {
        (Value::Nodes(a), Value::Nodes(b)) => a.iter().any(|x| {
            let x = Value::Str(string_value(x));
            b.iter()
                .any(|y| compare_atomic(&x, op, &Value::Str(string_value(y))))
        }),
        (Value::Nodes(a), Value::Bool(_)) => {
            compare_atomic(&Value::Bool(!a.is_empty()), op, right)
        }
        (Value::Bool(_), Value::Nodes(b)) => {
            compare_atomic(left, op, &Value::Bool(!b.is_empty()))
        }
        (Value::Nodes(a), other) => a
            .iter()
            .any(|x| compare_atomic(&Value::Str(string_value(x)), op, other)),
        (other, Value::Nodes(b)) => b
            .iter()
            .any(|y| compare_atomic(&Value::Str(string_value(y)), op.flip(), other)),
        _ => compare_atomic(left, op, right),
    }
}

fn compare_atomic(left: &Value<'_>, op: CmpOp, right: &Value<'_>) -> bool {
    match op {
        CmpOp::Eq | CmpOp::Ne => {
            let equal = match (left, right) {
                (Value::Bool(_), _) | (_, Value::Bool(_)) => to_bool(left) == to_bool(right),
                (Value::Num(_), _) | (_, Value::Num(_)) => to_number(left) == to_number(right),
                _ => to_string(left) == to_string(right),
            };
            equal == (op == CmpOp::Eq)
        }
        CmpOp::Lt => to_number(left) < to_number(right),
        CmpOp::Le => to_number(left) <= to_number(right),
        CmpOp::Gt => to_number(left) > to_number(right),
        CmpOp::Ge => to_number(left) >= to_number(right),
    }
}
