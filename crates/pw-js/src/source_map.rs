//! Function source recovery for page scripts.
//!
//! The engine renders every function as native code, so each page script is
//! scanned before it runs. Every function literal gets a span in the
//! [`SourceIndex`]. Function expressions are also wrapped in a
//! `__pw_tag(id, ...)` call that lets the runtime map a live handler back to
//! its span. Declarations, methods and expression-bodied arrows are left as
//! written and resolve by name.

use std::cmp::Reverse;

/// Global the instrumented scripts call to tag function expressions.
pub const TAG_FUNCTION: &str = "__pw_tag";

const REGEX_PRECEDING_KEYWORDS: &[&str] = &[
    "return",
    "typeof",
    "instanceof",
    "in",
    "of",
    "new",
    "delete",
    "void",
    "throw",
    "case",
    "do",
    "else",
    "yield",
    "await",
];

const OPERATOR_BYTES: &[u8] = b"=!<>+-*%&|^~?";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenKind {
    Ident,
    Punct,
    Literal,
    /// Template chunk ending in `${`.
    TemplateHead,
}

#[derive(Debug, Clone, Copy)]
struct Token {
    kind: TokenKind,
    start: usize,
    end: usize,
}

/// One function literal found in a page script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionSpan {
    pub origin: String,
    /// Own name, or the binding it is assigned to.
    pub name: Option<String>,
    pub line: usize,
    pub column: usize,
    script: usize,
    start: usize,
    end: usize,
}

impl FunctionSpan {
    /// `origin:line:column` of the function's first character.
    pub fn location(&self) -> String {
        format!("{}:{}:{}", self.origin, self.line, self.column)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ScannedFunction {
    start: usize,
    end: usize,
    name: Option<String>,
    tag: Option<TagInsert>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct TagInsert {
    /// Name the engine would have inferred had the literal not been wrapped.
    inferred_name: Option<String>,
}

/// Every function literal of every script executed in one context.
#[derive(Debug, Clone, Default)]
pub struct SourceIndex {
    scripts: Vec<String>,
    functions: Vec<FunctionSpan>,
}

impl SourceIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Indexes `source` and returns it with function expressions tagged.
    pub fn add_script(&mut self, origin: &str, source: &str) -> String {
        let script = self.scripts.len();
        let base = self.functions.len();
        let scanned = scan_functions(source);
        let positions = line_columns(source, scanned.iter().map(|function| function.start));

        let mut inserts: Vec<(usize, u8, Reverse<usize>, String)> = Vec::new();
        for (offset, (function, (line, column))) in scanned.iter().zip(positions).enumerate() {
            let id = base + offset;
            if let Some(tag) = &function.tag {
                inserts.push((
                    function.start,
                    1,
                    Reverse(function.end),
                    format!("{TAG_FUNCTION}({id}, "),
                ));
                let close = match &tag.inferred_name {
                    Some(name) => format!(", {})", quote(name)),
                    None => ")".to_owned(),
                };
                inserts.push((function.end, 0, Reverse(function.start), close));
            }
            self.functions.push(FunctionSpan {
                origin: origin.to_owned(),
                name: function.name.clone(),
                line,
                column,
                script,
                start: function.start,
                end: function.end,
            });
        }
        self.scripts.push(source.to_owned());

        inserts.sort();
        let mut rewritten = String::with_capacity(source.len() + inserts.len() * 16);
        let mut cursor = 0;
        for (position, _, _, text) in inserts {
            rewritten.push_str(&source[cursor..position]);
            rewritten.push_str(&text);
            cursor = position;
        }
        rewritten.push_str(&source[cursor..]);
        rewritten
    }

    pub fn function(&self, id: usize) -> Option<&FunctionSpan> {
        self.functions.get(id)
    }

    /// Source text of function `id` exactly as written.
    pub fn text(&self, id: usize) -> Option<&str> {
        let span = self.functions.get(id)?;
        self.scripts.get(span.script)?.get(span.start..span.end)
    }

    /// Latest function called `name`, preferring ones defined in `origin`.
    pub fn find_by_name(&self, name: &str, origin: Option<&str>) -> Option<usize> {
        if name.is_empty() {
            return None;
        }
        let named = || {
            self.functions
                .iter()
                .enumerate()
                .rev()
                .filter(move |(_, span)| span.name.as_deref() == Some(name))
        };
        origin
            .and_then(|origin| named().find(|(_, span)| span.origin == origin))
            .or_else(|| named().next())
            .map(|(id, _)| id)
    }

    /// Source text for a live handler: its tag first, then its name.
    pub fn resolve(&self, tag: Option<usize>, name: &str) -> Option<&str> {
        tag.and_then(|id| self.text(id))
            .or_else(|| self.find_by_name(name, None).and_then(|id| self.text(id)))
    }
}

fn quote(text: &str) -> String {
    let mut quoted = String::with_capacity(text.len() + 2);
    quoted.push('"');
    for ch in text.chars() {
        match ch {
            '"' => quoted.push_str("\\\""),
            '\\' => quoted.push_str("\\\\"),
            '\n' => quoted.push_str("\\n"),
            '\r' => quoted.push_str("\\r"),
            other => quoted.push(other),
        }
    }
    quoted.push('"');
    quoted
}

fn line_columns(source: &str, offsets: impl Iterator<Item = usize>) -> Vec<(usize, usize)> {
    let mut out = Vec::new();
    let mut line = 1;
    let mut line_start = 0;
    let mut scanned = 0;
    for offset in offsets {
        let offset = offset.min(source.len());
        if offset < scanned {
            line = 1 + source[..offset].matches('\n').count();
            line_start = source[..offset].rfind('\n').map_or(0, |index| index + 1);
        } else {
            for (index, byte) in source.as_bytes()[scanned..offset].iter().enumerate() {
                if *byte == b'\n' {
                    line += 1;
                    line_start = scanned + index + 1;
                }
            }
        }
        scanned = offset;
        let column = source
            .get(line_start..offset)
            .map_or(0, |prefix| prefix.chars().count())
            + 1;
        out.push((line, column));
    }
    out
}

fn scan_functions(source: &str) -> Vec<ScannedFunction> {
    let tokens = tokenize(source);
    let pairs = match_brackets(source, &tokens);
    let scanner = Scanner {
        source,
        tokens: &tokens,
        pairs: &pairs,
    };

    let mut found: Vec<ScannedFunction> = tokens
        .iter()
        .enumerate()
        .filter_map(|(index, _)| {
            if scanner.is_ident(index, "function") {
                scanner.function_literal(index)
            } else if scanner.is_punct(index, "=>") {
                scanner.arrow_function(index)
            } else {
                None
            }
        })
        .collect();
    found.sort_by_key(|function| function.start);
    found
}

struct Scanner<'a> {
    source: &'a str,
    tokens: &'a [Token],
    pairs: &'a [Option<usize>],
}

impl Scanner<'_> {
    fn text(&self, index: usize) -> &str {
        self.tokens
            .get(index)
            .and_then(|token| self.source.get(token.start..token.end))
            .unwrap_or("")
    }

    fn kind(&self, index: usize) -> Option<TokenKind> {
        self.tokens.get(index).map(|token| token.kind)
    }

    fn is_ident(&self, index: usize, text: &str) -> bool {
        self.kind(index) == Some(TokenKind::Ident) && self.text(index) == text
    }

    fn is_punct(&self, index: usize, text: &str) -> bool {
        self.kind(index) == Some(TokenKind::Punct) && self.text(index) == text
    }

    fn partner(&self, index: usize) -> Option<usize> {
        self.pairs.get(index).copied().flatten()
    }

    fn before(&self, index: usize) -> Option<usize> {
        index.checked_sub(1)
    }

    fn function_literal(&self, keyword: usize) -> Option<ScannedFunction> {
        if let Some(previous) = self.before(keyword) {
            if self.is_punct(previous, ".") || self.is_punct(previous, "?.") {
                return None;
            }
        }

        let mut first = keyword;
        if let Some(previous) = self.before(keyword) {
            if self.is_ident(previous, "async") {
                first = previous;
            }
        }

        let mut cursor = keyword + 1;
        if self.is_punct(cursor, "*") {
            cursor += 1;
        }
        let own_name = if self.kind(cursor) == Some(TokenKind::Ident) {
            cursor += 1;
            Some(self.text(cursor - 1).to_owned())
        } else {
            None
        };
        if !self.is_punct(cursor, "(") {
            return None;
        }
        let body = self.partner(cursor)? + 1;
        if !self.is_punct(body, "{") {
            return None;
        }
        let last = self.partner(body)?;

        let declaration = match self.before(first) {
            None => true,
            Some(previous) => {
                [";", "{", "}", ")"]
                    .iter()
                    .any(|punct| self.is_punct(previous, punct))
                    || self.is_ident(previous, "else")
                    || self.is_ident(previous, "do")
            }
        };

        let inferred = self.inferred_name(first);
        let tag = if declaration || self.blocks_wrapping(first) {
            None
        } else {
            Some(TagInsert {
                inferred_name: if own_name.is_some() {
                    None
                } else {
                    inferred.clone()
                },
            })
        };

        Some(ScannedFunction {
            start: self.tokens[first].start,
            end: self.tokens[last].end,
            name: own_name.or(inferred),
            tag,
        })
    }

    fn arrow_function(&self, arrow: usize) -> Option<ScannedFunction> {
        let params_end = self.before(arrow)?;
        let mut first = if self.is_punct(params_end, ")") {
            self.partner(params_end)?
        } else if self.kind(params_end) == Some(TokenKind::Ident) {
            params_end
        } else {
            return None;
        };
        if let Some(previous) = self.before(first) {
            if self.is_ident(previous, "async") {
                first = previous;
            }
        }

        let body = arrow + 1;
        let (last, block) = if self.is_punct(body, "{") {
            (self.partner(body)?, true)
        } else {
            (self.expression_end(body)?, false)
        };

        let inferred = self.inferred_name(first);
        let tag = if block && !self.blocks_wrapping(first) {
            Some(TagInsert {
                inferred_name: inferred.clone(),
            })
        } else {
            None
        };

        Some(ScannedFunction {
            start: self.tokens[first].start,
            end: self.tokens[last].end,
            name: inferred,
            tag,
        })
    }

    /// Last token of an arrow's expression body.
    fn expression_end(&self, start: usize) -> Option<usize> {
        let mut cursor = start;
        let mut last = None;
        while cursor < self.tokens.len() {
            let text = self.text(cursor);
            if self.kind(cursor) == Some(TokenKind::Punct)
                && matches!(text, "," | ";" | ")" | "]" | "}")
            {
                break;
            }
            if let Some(previous) = last {
                if self.starts_new_statement(previous, cursor) {
                    break;
                }
            }
            let end = match (self.kind(cursor), text) {
                (Some(TokenKind::Punct), "(" | "[" | "{") => self.partner(cursor)?,
                _ => cursor,
            };
            last = Some(end);
            cursor = end + 1;
        }
        last
    }

    /// A line break between two operands, where automatic semicolon
    /// insertion ends the statement.
    fn starts_new_statement(&self, previous: usize, next: usize) -> bool {
        let (Some(before), Some(after)) = (self.tokens.get(previous), self.tokens.get(next)) else {
            return false;
        };
        let operand_end = matches!(before.kind, TokenKind::Ident | TokenKind::Literal)
            || self.is_punct(previous, ")")
            || self.is_punct(previous, "]");
        let operand_start = matches!(after.kind, TokenKind::Ident | TokenKind::Literal);
        operand_end
            && operand_start
            && self
                .source
                .get(before.end..after.start)
                .is_some_and(|gap| gap.contains('\n'))
    }

    fn blocks_wrapping(&self, first: usize) -> bool {
        self.before(first).is_some_and(|previous| {
            self.is_ident(previous, "new")
                || self.is_punct(previous, ".")
                || self.is_punct(previous, "?.")
        })
    }

    /// `name = <fn>`, `var name = <fn>` and `{ name: <fn> }`.
    fn inferred_name(&self, first: usize) -> Option<String> {
        let operator = self.before(first)?;
        let binding = self.before(operator)?;
        if self.kind(binding) != Some(TokenKind::Ident) {
            return None;
        }
        let ahead = self.before(binding);
        if self.is_punct(operator, "=") {
            let member = ahead.is_some_and(|index| self.is_punct(index, ".") || self.is_punct(index, "?."));
            return (!member).then(|| self.text(binding).to_owned());
        }
        if self.is_punct(operator, ":") {
            let key = ahead.is_some_and(|index| self.is_punct(index, "{") || self.is_punct(index, ","));
            return key.then(|| self.text(binding).to_owned());
        }
        None
    }
}

fn tokenize(source: &str) -> Vec<Token> {
    let bytes = source.as_bytes();
    let mut tokens: Vec<Token> = Vec::new();
    let mut substitutions: Vec<usize> = Vec::new();
    let mut depth = 0usize;
    let mut index = 0;

    while index < bytes.len() {
        let byte = bytes[index];
        let start = index;
        match byte {
            b' ' | b'\t' | b'\n' | b'\r' | 0x0b | 0x0c => index += 1,
            b'/' if bytes.get(index + 1) == Some(&b'/') => {
                index = memchr_or_end(bytes, index, b'\n');
            }
            b'/' if bytes.get(index + 1) == Some(&b'*') => {
                index = find_from(bytes, index + 2, b"*/").map_or(bytes.len(), |end| end + 2);
            }
            b'/' if regex_allowed(source, tokens.last()) => {
                index = skip_regex(bytes, index);
                tokens.push(Token {
                    kind: TokenKind::Literal,
                    start,
                    end: index,
                });
            }
            b'\'' | b'"' => {
                index = skip_string(bytes, index, byte);
                tokens.push(Token {
                    kind: TokenKind::Literal,
                    start,
                    end: index,
                });
            }
            b'`' => {
                let (end, open) = skip_template(bytes, index + 1);
                index = end;
                tokens.push(template_token(start, end, open));
                if open {
                    substitutions.push(depth);
                }
            }
            b'}' if substitutions.last() == Some(&depth) => {
                substitutions.pop();
                let (end, open) = skip_template(bytes, index + 1);
                index = end;
                tokens.push(template_token(start, end, open));
                if open {
                    substitutions.push(depth);
                }
            }
            b'0'..=b'9' => {
                index += 1;
                while index < bytes.len()
                    && (bytes[index].is_ascii_alphanumeric() || matches!(bytes[index], b'_' | b'.'))
                {
                    index += 1;
                }
                tokens.push(Token {
                    kind: TokenKind::Literal,
                    start,
                    end: index,
                });
            }
            _ if is_ident_byte(byte) || byte == b'#' => {
                index += 1;
                while index < bytes.len() && is_ident_byte(bytes[index]) {
                    index += 1;
                }
                tokens.push(Token {
                    kind: TokenKind::Ident,
                    start,
                    end: index,
                });
            }
            b'?' if bytes.get(index + 1) == Some(&b'.')
                && !bytes.get(index + 2).is_some_and(u8::is_ascii_digit) =>
            {
                index += 2;
                tokens.push(punct(start, index));
            }
            b'.' if bytes.get(index + 1) == Some(&b'.') && bytes.get(index + 2) == Some(&b'.') => {
                index += 3;
                tokens.push(punct(start, index));
            }
            _ if OPERATOR_BYTES.contains(&byte) => {
                index += 1;
                while index < bytes.len() && OPERATOR_BYTES.contains(&bytes[index]) {
                    if bytes[index] == b'?' && bytes.get(index + 1) == Some(&b'.') {
                        break;
                    }
                    index += 1;
                }
                tokens.push(punct(start, index));
            }
            _ => {
                if byte == b'{' {
                    depth += 1;
                } else if byte == b'}' {
                    depth = depth.saturating_sub(1);
                }
                index += 1;
                if byte == b'/' && bytes.get(index) == Some(&b'=') {
                    index += 1;
                }
                tokens.push(punct(start, index));
            }
        }
    }

    tokens
}

fn punct(start: usize, end: usize) -> Token {
    Token {
        kind: TokenKind::Punct,
        start,
        end,
    }
}

fn template_token(start: usize, end: usize, open: bool) -> Token {
    Token {
        kind: if open {
            TokenKind::TemplateHead
        } else {
            TokenKind::Literal
        },
        start,
        end,
    }
}

fn is_ident_byte(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || matches!(byte, b'_' | b'$' | b'\\') || byte >= 0x80
}

fn regex_allowed(source: &str, previous: Option<&Token>) -> bool {
    let Some(token) = previous else {
        return true;
    };
    let text = source.get(token.start..token.end).unwrap_or("");
    match token.kind {
        TokenKind::Punct => !matches!(text, ")" | "]"),
        TokenKind::Ident => REGEX_PRECEDING_KEYWORDS.contains(&text),
        TokenKind::Literal => false,
        TokenKind::TemplateHead => true,
    }
}

fn memchr_or_end(bytes: &[u8], from: usize, needle: u8) -> usize {
    bytes[from..]
        .iter()
        .position(|byte| *byte == needle)
        .map_or(bytes.len(), |offset| from + offset)
}

fn find_from(bytes: &[u8], from: usize, needle: &[u8]) -> Option<usize> {
    bytes
        .get(from..)?
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|offset| from + offset)
}

fn skip_string(bytes: &[u8], start: usize, quote: u8) -> usize {
    let mut index = start + 1;
    while index < bytes.len() {
        match bytes[index] {
            b'\\' => index += 2,
            b'\n' => return index,
            byte if byte == quote => return index + 1,
            _ => index += 1,
        }
    }
    bytes.len()
}

/// Returns the end of the chunk and whether it stopped at `${`.
fn skip_template(bytes: &[u8], from: usize) -> (usize, bool) {
    let mut index = from;
    while index < bytes.len() {
        match bytes[index] {
            b'\\' => index += 2,
            b'`' => return (index + 1, false),
            b'$' if bytes.get(index + 1) == Some(&b'{') => return (index + 2, true),
            _ => index += 1,
        }
    }
    (bytes.len(), false)
}

fn skip_regex(bytes: &[u8], start: usize) -> usize {
    let mut index = start + 1;
    let mut in_class = false;
    while index < bytes.len() {
        match bytes[index] {
            b'\\' => index += 2,
            b'\n' => return index,
            b'[' => {
                in_class = true;
                index += 1;
            }
            b']' => {
                in_class = false;
                index += 1;
            }
            b'/' if !in_class => {
                index += 1;
                while index < bytes.len() && bytes[index].is_ascii_alphabetic() {
                    index += 1;
                }
                return index;
            }
            _ => index += 1,
        }
    }
    bytes.len()
}

fn match_brackets(source: &str, tokens: &[Token]) -> Vec<Option<usize>> {
    let mut pairs = vec![None; tokens.len()];
    let mut open: Vec<(usize, u8)> = Vec::new();
    for (index, token) in tokens.iter().enumerate() {
        if token.kind != TokenKind::Punct {
            continue;
        }
        let byte = source.as_bytes()[token.start];
        match byte {
            b'(' | b'[' | b'{' => open.push((index, byte)),
            b')' | b']' | b'}' => {
                let expected = match byte {
                    b')' => b'(',
                    b']' => b'[',
                    _ => b'{',
                };
                if let Some(position) = open.iter().rposition(|(_, kind)| *kind == expected) {
                    let (opener, _) = open[position];
                    open.truncate(position);
                    pairs[opener] = Some(index);
                    pairs[index] = Some(opener);
                }
            }
            _ => {}
        }
    }
    pairs
}
