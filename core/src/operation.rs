use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The three GraphQL operation types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Query,
    Mutation,
    Subscription,
}

/// Transport family an operation travels over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// One request, one response.
    Unary,
    /// Long-lived connection carrying server pushes.
    Streaming,
}

/// Pick the channel for an operation kind.
pub fn classify(kind: OperationKind) -> ChannelKind {
    match kind {
        OperationKind::Subscription => ChannelKind::Streaming,
        OperationKind::Query | OperationKind::Mutation => ChannelKind::Unary,
    }
}

/// A GraphQL operation ready to be routed.
///
/// `kind` is fixed at construction; there is no setter.
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    kind: OperationKind,
    name: Option<String>,
    document: String,
    variables: Map<String, Value>,
}

impl Operation {
    pub fn new(kind: OperationKind, document: impl Into<String>) -> Self {
        let document = document.into();
        let name = operation_name(&document);
        Self {
            kind,
            name,
            document,
            variables: Map::new(),
        }
    }

    /// Build an operation by reading the kind out of the document itself.
    pub fn parse(document: impl Into<String>) -> Option<Self> {
        let document = document.into();
        let kind = detect_kind(&document)?;
        Some(Self::new(kind, document))
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn channel(&self) -> ChannelKind {
        classify(self.kind)
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn document(&self) -> &str {
        &self.document
    }

    pub fn variables(&self) -> &Map<String, Value> {
        &self.variables
    }

    pub fn variable(&self, key: &str) -> Option<&Value> {
        self.variables.get(key)
    }

    /// Request body shared by the HTTP and WebSocket transports.
    pub fn payload(&self) -> OperationPayload<'_> {
        OperationPayload {
            query: &self.document,
            variables: &self.variables,
            operation_name: self.name.as_deref(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationPayload<'a> {
    pub query: &'a str,
    pub variables: &'a Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation_name: Option<&'a str>,
}

/// Kind of the first operation definition in a document.
///
/// Comments and fragment definitions are skipped; a bare selection set is a
/// query shorthand.
pub fn detect_kind(document: &str) -> Option<OperationKind> {
    let mut tokens = Tokens::new(document);
    while let Some(token) = tokens.next() {
        match token {
            "{" => return Some(OperationKind::Query),
            "query" => return Some(OperationKind::Query),
            "mutation" => return Some(OperationKind::Mutation),
            "subscription" => return Some(OperationKind::Subscription),
            "fragment" => tokens.skip_block(),
            _ => return None,
        }
    }
    None
}

fn operation_name(document: &str) -> Option<String> {
    let mut tokens = Tokens::new(document);
    while let Some(token) = tokens.next() {
        match token {
            "query" | "mutation" | "subscription" => {
                return tokens
                    .next()
                    .filter(|name| name.chars().all(|c| c.is_alphanumeric() || c == '_'))
                    .map(str::to_string);
            }
            "fragment" => tokens.skip_block(),
            _ => return None,
        }
    }
    None
}

/// Minimal lexer over names and punctuation, enough to find definition
/// keywords.
struct Tokens<'a> {
    rest: &'a str,
}

impl<'a> Tokens<'a> {
    fn new(source: &'a str) -> Self {
        Self { rest: source }
    }

    fn skip_ignored(&mut self) {
        loop {
            let trimmed = self
                .rest
                .trim_start_matches(|c: char| c.is_whitespace() || c == ',' || c == '\u{feff}');
            if let Some(comment) = trimmed.strip_prefix('#') {
                self.rest = comment.find('\n').map_or("", |idx| &comment[idx..]);
            } else {
                self.rest = trimmed;
                return;
            }
        }
    }

    fn next(&mut self) -> Option<&'a str> {
        self.skip_ignored();
        let first = self.rest.chars().next()?;
        let len = if first.is_alphanumeric() || first == '_' {
            self.rest
                .find(|c: char| !(c.is_alphanumeric() || c == '_'))
                .unwrap_or(self.rest.len())
        } else {
            first.len_utf8()
        };
        let (token, rest) = self.rest.split_at(len);
        self.rest = rest;
        Some(token)
    }

    /// Skip past the next balanced `{ ... }` block, ignoring string contents.
    fn skip_block(&mut self) {
        let mut depth = 0usize;
        let mut in_string = false;
        let mut chars = self.rest.char_indices();
        while let Some((idx, c)) = chars.next() {
            match c {
                '"' => in_string = !in_string,
                '\\' if in_string => {
                    chars.next();
                }
                '{' if !in_string => depth += 1,
                '}' if !in_string => {
                    depth = depth.saturating_sub(1);
                    if depth == 0 {
                        self.rest = &self.rest[idx + 1..];
                        return;
                    }
                }
                _ => {}
            }
        }
        self.rest = "";
    }
}
