//! Breakpoint condition expressions.
//!
//! ```text
//! expr    := and ("||" and)*
//! and     := cmp ("&&" cmp)*
//! cmp     := primary (("==" | "!=" | "<" | "<=" | ">" | ">=") primary)?
//! primary := number | register | "(" expr ")"
//! ```
//!
//! Numbers are decimal or `0x` hex. Registers use ABI names (`a0`, `ra`),
//! `r0`..`r31`, or `pc`, `hi`, `lo`. Comparisons are unsigned.

use thiserror::Error;

use crate::cpu::state::{layout, GuestRegisters};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExpressionError {
    #[error("unexpected character '{0}' at offset {1}")]
    UnexpectedChar(char, usize),
    #[error("unknown register '{0}'")]
    UnknownRegister(String),
    #[error("invalid number '{0}'")]
    InvalidNumber(String),
    #[error("unexpected end of expression")]
    UnexpectedEnd,
    #[error("unexpected token '{0}'")]
    UnexpectedToken(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Register {
    Gpr(u8),
    Pc,
    Hi,
    Lo,
}

impl Register {
    fn parse(name: &str) -> Option<Self> {
        let lower = name.to_ascii_lowercase();
        match lower.as_str() {
            "pc" => return Some(Register::Pc),
            "hi" => return Some(Register::Hi),
            "lo" => return Some(Register::Lo),
            "s8" => return Some(Register::Gpr(30)),
            _ => {}
        }
        if let Some(idx) = layout::GPR_NAMES.iter().position(|n| *n == lower) {
            return Some(Register::Gpr(idx as u8));
        }
        let num = lower.strip_prefix('r').or_else(|| lower.strip_prefix('$'))?;
        match num.parse::<u8>() {
            Ok(n) if n < 32 => Some(Register::Gpr(n)),
            _ => None,
        }
    }

    fn read(self, regs: &GuestRegisters) -> u32 {
        match self {
            Register::Gpr(n) => regs.gpr(n),
            Register::Pc => regs.pc(),
            Register::Hi => regs.hi(),
            Register::Lo => regs.lo(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Node {
    Literal(u32),
    Register(Register),
    Binary(BinOp, Box<Node>, Box<Node>),
}

impl Node {
    fn eval(&self, regs: &GuestRegisters) -> u32 {
        match self {
            Node::Literal(v) => *v,
            Node::Register(r) => r.read(regs),
            Node::Binary(op, a, b) => {
                let x = a.eval(regs);
                // Short-circuit the logical forms.
                match op {
                    BinOp::And if x == 0 => return 0,
                    BinOp::Or if x != 0 => return 1,
                    _ => {}
                }
                let y = b.eval(regs);
                let r = match op {
                    BinOp::Eq => x == y,
                    BinOp::Ne => x != y,
                    BinOp::Lt => x < y,
                    BinOp::Le => x <= y,
                    BinOp::Gt => x > y,
                    BinOp::Ge => x >= y,
                    BinOp::And | BinOp::Or => y != 0,
                };
                r as u32
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Number(u32),
    Ident(String),
    Op(BinOp),
    Open,
    Close,
}

fn tokenize(src: &str) -> Result<Vec<Token>, ExpressionError> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        let two = |op| (Token::Op(op), 2);
        let (token, width) = match (c, next) {
            ('(', _) => (Token::Open, 1),
            (')', _) => (Token::Close, 1),
            ('=', Some('=')) => two(BinOp::Eq),
            ('!', Some('=')) => two(BinOp::Ne),
            ('<', Some('=')) => two(BinOp::Le),
            ('>', Some('=')) => two(BinOp::Ge),
            ('&', Some('&')) => two(BinOp::And),
            ('|', Some('|')) => two(BinOp::Or),
            ('<', _) => (Token::Op(BinOp::Lt), 1),
            ('>', _) => (Token::Op(BinOp::Gt), 1),
            _ if c.is_ascii_alphanumeric() || c == '$' || c == '_' => {
                let start = i;
                let mut end = i;
                while end < chars.len()
                    && (chars[end].is_ascii_alphanumeric()
                        || chars[end] == '$'
                        || chars[end] == '_')
                {
                    end += 1;
                }
                let word: String = chars[start..end].iter().collect();
                let token = if c.is_ascii_digit() {
                    Token::Number(parse_number(&word)?)
                } else {
                    Token::Ident(word)
                };
                (token, end - start)
            }
            _ => return Err(ExpressionError::UnexpectedChar(c, i)),
        };
        tokens.push(token);
        i += width;
    }
    Ok(tokens)
}

fn parse_number(word: &str) -> Result<u32, ExpressionError> {
    let parsed = match word.strip_prefix("0x").or_else(|| word.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => word.parse::<u32>(),
    };
    parsed.map_err(|_| ExpressionError::InvalidNumber(word.to_string()))
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn parse_or(&mut self) -> Result<Node, ExpressionError> {
        let mut lhs = self.parse_and()?;
        while self.peek() == Some(&Token::Op(BinOp::Or)) {
            self.pos += 1;
            let rhs = self.parse_and()?;
            lhs = Node::Binary(BinOp::Or, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Node, ExpressionError> {
        let mut lhs = self.parse_cmp()?;
        while self.peek() == Some(&Token::Op(BinOp::And)) {
            self.pos += 1;
            let rhs = self.parse_cmp()?;
            lhs = Node::Binary(BinOp::And, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_cmp(&mut self) -> Result<Node, ExpressionError> {
        let lhs = self.parse_primary()?;
        match self.peek() {
            Some(Token::Op(op)) if !matches!(op, BinOp::And | BinOp::Or) => {
                let op = *op;
                self.pos += 1;
                let rhs = self.parse_primary()?;
                Ok(Node::Binary(op, Box::new(lhs), Box::new(rhs)))
            }
            _ => Ok(lhs),
        }
    }

    fn parse_primary(&mut self) -> Result<Node, ExpressionError> {
        match self.next() {
            Some(Token::Number(v)) => Ok(Node::Literal(v)),
            Some(Token::Ident(name)) => Register::parse(&name)
                .map(Node::Register)
                .ok_or(ExpressionError::UnknownRegister(name)),
            Some(Token::Open) => {
                let inner = self.parse_or()?;
                match self.next() {
                    Some(Token::Close) => Ok(inner),
                    Some(t) => Err(ExpressionError::UnexpectedToken(format!("{:?}", t))),
                    None => Err(ExpressionError::UnexpectedEnd),
                }
            }
            Some(t) => Err(ExpressionError::UnexpectedToken(format!("{:?}", t))),
            None => Err(ExpressionError::UnexpectedEnd),
        }
    }
}

/// A parsed condition, evaluated against the register file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expression {
    source: String,
    root: Node,
}

impl Expression {
    pub fn parse(source: &str) -> Result<Self, ExpressionError> {
        let tokens = tokenize(source)?;
        let mut parser = Parser { tokens, pos: 0 };
        let root = parser.parse_or()?;
        if let Some(t) = parser.peek() {
            return Err(ExpressionError::UnexpectedToken(format!("{:?}", t)));
        }
        Ok(Self {
            source: source.to_string(),
            root,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn evaluate(&self, regs: &GuestRegisters) -> u32 {
        self.root.eval(regs)
    }

    pub fn is_true(&self, regs: &GuestRegisters) -> bool {
        self.evaluate(regs) != 0
    }
}

/// Expand `{reg}` placeholders in a breakpoint log format. Unknown names
/// are left as written.
pub fn format_log(format: &str, regs: &GuestRegisters) -> String {
    let mut out = String::with_capacity(format.len());
    let mut rest = format;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find('}') {
            Some(close) => {
                let name = &after[..close];
                match Register::parse(name.trim()) {
                    Some(r) => out.push_str(&format!("{:08x}", r.read(regs))),
                    None => {
                        out.push('{');
                        out.push_str(name);
                        out.push('}');
                    }
                }
                rest = &after[close + 1..];
            }
            None => {
                out.push_str(&rest[open..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}
