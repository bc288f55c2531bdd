use super::expr::{BinaryOp, Expr, TemplatePart, UnaryOp};
use crate::error::{RecordbaseError, Result};

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(String),
    Str(String),
    Template(Vec<TemplateChunk>),
    Punct(&'static str),
}

#[derive(Debug, Clone, PartialEq)]
enum TemplateChunk {
    Text(String),
    Source(String),
}

const PUNCTUATION: &[&str] = &[
    "===", "!==", "=>", "==", "!=", ">=", "<=", "&&", "||", "??", "(", ")", "[", "]", "{", "}",
    ",", ".", "?", ":", ";", "!", "+", "-", "*", "/", ">", "<",
];

/// Parse a computed-field body into an expression tree.
pub fn parse_expression(source: &str) -> Result<Expr> {
    let tokens = tokenize(source)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        source,
    };
    let expr = parser.expression()?;
    if parser.pos < parser.tokens.len() {
        return Err(parser.error("unexpected trailing input"));
    }
    Ok(expr)
}

fn tokenize(source: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        if c.is_ascii_alphabetic() || c == '_' || c == '$' {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_' || chars[i] == '$') {
                i += 1;
            }
            tokens.push(Token::Ident(chars[start..i].iter().collect()));
            continue;
        }
        if c.is_ascii_digit() {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            tokens.push(Token::Number(chars[start..i].iter().collect()));
            continue;
        }
        if c == '"' || c == '\'' {
            let (text, next) = read_string(&chars, i + 1, c)?;
            tokens.push(Token::Str(text));
            i = next;
            continue;
        }
        if c == '`' {
            let (chunks, next) = read_template(&chars, i + 1)?;
            tokens.push(Token::Template(chunks));
            i = next;
            continue;
        }
        let rest: String = chars[i..chars.len().min(i + 3)].iter().collect();
        match PUNCTUATION.iter().find(|p| rest.starts_with(*p)) {
            Some(p) => {
                tokens.push(Token::Punct(p));
                i += p.len();
            }
            None => {
                return Err(RecordbaseError::Compile(format!(
                    "unexpected character '{c}' in expression: {source}"
                )))
            }
        }
    }
    Ok(tokens)
}

fn read_string(chars: &[char], mut i: usize, quote: char) -> Result<(String, usize)> {
    let mut text = String::new();
    while i < chars.len() {
        match chars[i] {
            '\\' if i + 1 < chars.len() => {
                text.push(unescape(chars[i + 1]));
                i += 2;
            }
            c if c == quote => return Ok((text, i + 1)),
            c => {
                text.push(c);
                i += 1;
            }
        }
    }
    Err(RecordbaseError::Compile("unterminated string literal".into()))
}

fn unescape(c: char) -> char {
    match c {
        'n' => '\n',
        't' => '\t',
        'r' => '\r',
        other => other,
    }
}

fn read_template(chars: &[char], mut i: usize) -> Result<(Vec<TemplateChunk>, usize)> {
    let mut chunks = Vec::new();
    let mut text = String::new();
    while i < chars.len() {
        match chars[i] {
            '`' => {
                chunks.push(TemplateChunk::Text(text));
                return Ok((chunks, i + 1));
            }
            '\\' if i + 1 < chars.len() => {
                text.push(unescape(chars[i + 1]));
                i += 2;
            }
            '$' if chars.get(i + 1) == Some(&'{') => {
                chunks.push(TemplateChunk::Text(std::mem::take(&mut text)));
                let mut depth = 1;
                let start = i + 2;
                i = start;
                while i < chars.len() && depth > 0 {
                    match chars[i] {
                        '{' => depth += 1,
                        '}' => depth -= 1,
                        '"' | '\'' => {
                            let (_, next) = read_string(chars, i + 1, chars[i])?;
                            i = next;
                            continue;
                        }
                        _ => {}
                    }
                    i += 1;
                }
                if depth != 0 {
                    break;
                }
                chunks.push(TemplateChunk::Source(chars[start..i - 1].iter().collect()));
            }
            c => {
                text.push(c);
                i += 1;
            }
        }
    }
    Err(RecordbaseError::Compile("unterminated template literal".into()))
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    source: &'a str,
}

impl<'a> Parser<'a> {
    fn error(&self, message: &str) -> RecordbaseError {
        let near = self
            .tokens
            .get(self.pos)
            .map(|t| format!("{t:?}"))
            .unwrap_or_else(|| "end of input".into());
        RecordbaseError::Compile(format!("{message} near {near} in: {}", self.source))
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_punct(&self, p: &str) -> bool {
        matches!(self.peek(), Some(Token::Punct(q)) if *q == p)
    }

    fn eat(&mut self, p: &str) -> bool {
        if self.peek_punct(p) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, p: &str) -> Result<()> {
        if self.eat(p) {
            Ok(())
        } else {
            Err(self.error(&format!("expected '{p}'")))
        }
    }

    fn ident(&mut self) -> Result<String> {
        match self.peek() {
            Some(Token::Ident(name)) => {
                let name = name.clone();
                self.pos += 1;
                Ok(name)
            }
            _ => Err(self.error("expected identifier")),
        }
    }

    fn expression(&mut self) -> Result<Expr> {
        if let Some(lambda) = self.try_lambda()? {
            return Ok(lambda);
        }
        self.conditional()
    }

    /// `x => body`, `(a, b) => body` or `(a) => { return body; }`.
    fn try_lambda(&mut self) -> Result<Option<Expr>> {
        let start = self.pos;
        let mut params = Vec::new();
        match self.peek() {
            Some(Token::Ident(name)) if self.tokens.get(self.pos + 1) == Some(&Token::Punct("=>")) => {
                params.push(name.clone());
                self.pos += 1;
            }
            Some(Token::Punct("(")) => {
                self.pos += 1;
                loop {
                    match self.peek() {
                        Some(Token::Ident(name)) => {
                            params.push(name.clone());
                            self.pos += 1;
                        }
                        Some(Token::Punct(")")) => {}
                        _ => {
                            self.pos = start;
                            return Ok(None);
                        }
                    }
                    if self.eat(",") {
                        continue;
                    }
                    if self.eat(")") {
                        break;
                    }
                    self.pos = start;
                    return Ok(None);
                }
                if !self.peek_punct("=>") {
                    self.pos = start;
                    return Ok(None);
                }
            }
            _ => return Ok(None),
        }
        self.expect("=>")?;
        let body = if self.eat("{") {
            match self.peek() {
                Some(Token::Ident(kw)) if kw == "return" => self.pos += 1,
                _ => return Err(self.error("expected a single return statement")),
            }
            let body = self.expression()?;
            self.eat(";");
            self.expect("}")?;
            body
        } else {
            self.expression()?
        };
        Ok(Some(Expr::Lambda {
            params,
            body: Box::new(body),
        }))
    }

    fn conditional(&mut self) -> Result<Expr> {
        let test = self.binary(0)?;
        if self.eat("?") {
            let then = self.expression()?;
            self.expect(":")?;
            let otherwise = self.expression()?;
            return Ok(Expr::conditional(test, then, otherwise));
        }
        Ok(test)
    }

    fn binary(&mut self, min_level: u8) -> Result<Expr> {
        let mut left = self.unary()?;
        loop {
            let (op, level) = match self.peek() {
                Some(Token::Punct(p)) => match binary_op(p) {
                    Some(found) => found,
                    None => break,
                },
                _ => break,
            };
            if level < min_level {
                break;
            }
            self.pos += 1;
            let right = self.binary(level + 1)?;
            left = Expr::binary(op, left, right);
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr> {
        if self.eat("!") {
            return Ok(Expr::Unary(UnaryOp::Not, Box::new(self.unary()?)));
        }
        if self.eat("-") {
            return Ok(Expr::Unary(UnaryOp::Neg, Box::new(self.unary()?)));
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr> {
        let mut expr = self.primary()?;
        loop {
            if self.eat(".") {
                let name = self.ident()?;
                if self.eat("(") {
                    let args = self.arguments()?;
                    expr = expr.method(&name, args);
                } else {
                    expr = expr.member(&name);
                }
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn arguments(&mut self) -> Result<Vec<Expr>> {
        let mut args = Vec::new();
        if self.eat(")") {
            return Ok(args);
        }
        loop {
            args.push(self.expression()?);
            if self.eat(")") {
                return Ok(args);
            }
            self.expect(",")?;
        }
    }

    fn primary(&mut self) -> Result<Expr> {
        let token = self.peek().cloned().ok_or_else(|| self.error("unexpected end"))?;
        self.pos += 1;
        match token {
            Token::Number(n) => Ok(Expr::Number(n)),
            Token::Str(s) => Ok(Expr::Str(s)),
            Token::Template(chunks) => {
                let mut parts = Vec::new();
                for chunk in chunks {
                    match chunk {
                        TemplateChunk::Text(text) => parts.push(TemplatePart::Text(text)),
                        TemplateChunk::Source(src) => parts.push(TemplatePart::Expr(parse_expression(&src)?)),
                    }
                }
                Ok(Expr::Template(parts))
            }
            Token::Punct("(") => {
                let inner = self.expression()?;
                self.expect(")")?;
                Ok(inner)
            }
            Token::Punct("[") => {
                let mut items = Vec::new();
                if !self.eat("]") {
                    loop {
                        items.push(self.expression()?);
                        if self.eat("]") {
                            break;
                        }
                        self.expect(",")?;
                    }
                }
                Ok(Expr::Array(items))
            }
            Token::Ident(name) => match name.as_str() {
                "true" => Ok(Expr::Bool(true)),
                "false" => Ok(Expr::Bool(false)),
                "null" | "undefined" => Ok(Expr::Null),
                "new" => {
                    let class = self.ident()?;
                    self.expect("(")?;
                    let args = self.arguments()?;
                    Ok(Expr::New { class, args })
                }
                _ => {
                    if self.eat("(") {
                        let args = self.arguments()?;
                        Ok(Expr::call(&name, args))
                    } else {
                        Ok(Expr::Ident(name))
                    }
                }
            },
            Token::Punct(_) => {
                self.pos -= 1;
                Err(self.error("unexpected token"))
            }
        }
    }
}

fn binary_op(p: &str) -> Option<(BinaryOp, u8)> {
    Some(match p {
        "??" => (BinaryOp::Coalesce, 1),
        "||" => (BinaryOp::Or, 2),
        "&&" => (BinaryOp::And, 3),
        "===" | "==" => (BinaryOp::Eq, 4),
        "!==" | "!=" => (BinaryOp::Ne, 4),
        ">" => (BinaryOp::Gt, 5),
        ">=" => (BinaryOp::Ge, 5),
        "<" => (BinaryOp::Lt, 5),
        "<=" => (BinaryOp::Le, 5),
        "+" => (BinaryOp::Add, 6),
        "-" => (BinaryOp::Sub, 6),
        "*" => (BinaryOp::Mul, 7),
        "/" => (BinaryOp::Div, 7),
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_lambda_with_member_access() {
        let expr = parse_expression("(family) => family.mother.name").unwrap();
        assert_eq!(
            expr,
            Expr::lambda(&["family"], Expr::ident("family").member("mother").member("name"))
        );
    }

    #[test]
    fn test_parse_block_body() {
        let expr = parse_expression("(x) => { return x.total; }").unwrap();
        assert_eq!(expr, Expr::lambda(&["x"], Expr::ident("x").member("total")));
    }

    #[test]
    fn test_parse_nested_combinator() {
        let expr =
            parse_expression("(family) => sumMap(family.children, (child) => child.happy ? 1 : 0)").unwrap();
        let expected = Expr::lambda(
            &["family"],
            Expr::call(
                "sumMap",
                vec![
                    Expr::ident("family").member("children"),
                    Expr::lambda(
                        &["child"],
                        Expr::conditional(
                            Expr::ident("child").member("happy"),
                            Expr::Number("1".into()),
                            Expr::Number("0".into()),
                        ),
                    ),
                ],
            ),
        );
        assert_eq!(expr, expected);
    }

    #[test]
    fn test_parse_precedence() {
        let expr = parse_expression("a || b && c === d").unwrap();
        let expected = Expr::binary(
            BinaryOp::Or,
            Expr::ident("a"),
            Expr::binary(
                BinaryOp::And,
                Expr::ident("b"),
                Expr::binary(BinaryOp::Eq, Expr::ident("c"), Expr::ident("d")),
            ),
        );
        assert_eq!(expr, expected);
    }

    #[test]
    fn test_parse_method_chain_and_new() {
        let expr = parse_expression("x.price.times(new Decimal(\"1.5\")).toDecimalPlaces(2)").unwrap();
        let expected = Expr::ident("x").member("price").method(
            "times",
            vec![Expr::New {
                class: "Decimal".into(),
                args: vec![Expr::string("1.5")],
            }],
        );
        let expected = expected.method("toDecimalPlaces", vec![Expr::Number("2".into())]);
        assert_eq!(expr, expected);
    }

    #[test]
    fn test_parse_template_literal() {
        let expr = parse_expression("`${p.name} (${p.code})`").unwrap();
        assert_eq!(
            expr,
            Expr::Template(vec![
                TemplatePart::Text("".into()),
                TemplatePart::Expr(Expr::ident("p").member("name")),
                TemplatePart::Text(" (".into()),
                TemplatePart::Expr(Expr::ident("p").member("code")),
                TemplatePart::Text(")".into()),
            ])
        );
    }

    #[test]
    fn test_parenthesized_expression_is_not_lambda() {
        let expr = parse_expression("(a) + b").unwrap();
        assert_eq!(expr, Expr::binary(BinaryOp::Add, Expr::ident("a"), Expr::ident("b")));
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_expression("a +").is_err());
        assert!(parse_expression("'open").is_err());
        assert!(parse_expression("a # b").is_err());
        assert!(parse_expression("(x) => { x }").is_err());
    }
}
