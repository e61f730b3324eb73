//! Response transformation: raw bytes in, typed content out.
//!
//! A [`TransformerChain`] is an ordered list of (media-type pattern,
//! transformer) pairs. Each transformer whose pattern matches the current
//! content type runs in registration order; the first failure short-circuits
//! the chain and the request resolves as a parse error. Transformers are
//! pure functions over [`Content`] — they never see the resource or the
//! service, which keeps them independently testable and reusable.
//!
//! The [`TransformerChain::standard`] chain decodes JSON (`*/json`), plain
//! text (`text/*`) and XML (`*/xml`, surfaced as decoded text). When a
//! response carries no usable content type, [`sniff_content_type`] guesses
//! one from the leading bytes.

use std::sync::Arc;

use crate::error::TransformError;

/// Decoded response payload.
#[derive(Debug, Clone, PartialEq)]
pub enum ContentValue {
    /// Raw, undecoded bytes.
    Bytes(Vec<u8>),
    /// Decoded text (plain text, XML).
    Text(String),
    /// Parsed JSON document.
    Json(serde_json::Value),
}

impl ContentValue {
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            ContentValue::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ContentValue::Text(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            ContentValue::Json(v) => Some(v),
            _ => None,
        }
    }
}

/// A payload plus the content type describing it. Transformers map one
/// `Content` to another, possibly changing both fields.
#[derive(Debug, Clone, PartialEq)]
pub struct Content {
    pub value: ContentValue,
    pub content_type: String,
}

impl Content {
    pub fn new(value: ContentValue, content_type: impl Into<String>) -> Self {
        Content {
            value,
            content_type: content_type.into(),
        }
    }

    /// Text content, convenience constructor.
    pub fn text(text: impl Into<String>) -> Self {
        Content::new(ContentValue::Text(text.into()), "text/plain")
    }

    /// JSON content, convenience constructor.
    pub fn json(value: serde_json::Value) -> Self {
        Content::new(ContentValue::Json(value), "application/json")
    }
}

/// One stage of the pipeline.
pub trait ResponseTransformer: Send + Sync {
    /// Maps content to content, or fails the whole chain.
    fn transform(&self, content: Content) -> Result<Content, TransformError>;
}

/// A `type/subtype` pattern where either side may be `*`.
///
/// Matching ignores parameters (`application/json; charset=utf-8` matches
/// `*/json`) and is case-insensitive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaTypePattern {
    kind: String,
    subtype: String,
}

impl MediaTypePattern {
    /// Parses a pattern like `application/json`, `text/*` or `*/*`.
    /// Falls back to `*/*` for strings without a slash.
    pub fn new(pattern: &str) -> Self {
        let mut parts = pattern.splitn(2, '/');
        let kind = parts.next().unwrap_or("*").trim().to_ascii_lowercase();
        let subtype = parts.next().unwrap_or("*").trim().to_ascii_lowercase();
        MediaTypePattern { kind, subtype }
    }

    /// Whether a concrete content type (possibly with parameters) matches.
    pub fn matches(&self, content_type: &str) -> bool {
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or("")
            .trim()
            .to_ascii_lowercase();
        let mut parts = essence.splitn(2, '/');
        let kind = parts.next().unwrap_or("");
        let subtype = parts.next().unwrap_or("");
        (self.kind == "*" || self.kind == kind) && (self.subtype == "*" || self.subtype == subtype)
    }
}

struct ChainEntry {
    pattern: MediaTypePattern,
    transformer: Arc<dyn ResponseTransformer>,
}

/// Ordered, content-type-matched sequence of transformers.
#[derive(Clone, Default)]
pub struct TransformerChain {
    entries: Vec<Arc<ChainEntry>>,
}

impl TransformerChain {
    /// An empty chain: responses pass through as raw bytes.
    pub fn new() -> Self {
        TransformerChain::default()
    }

    /// The built-in chain: JSON, plain text, XML-as-text.
    pub fn standard() -> Self {
        let mut chain = TransformerChain::new();
        chain.append("*/json", JsonTransformer);
        chain.append("text/*", TextTransformer);
        chain.append("*/xml", TextTransformer);
        chain
    }

    /// Appends a transformer for content types matching `pattern`.
    pub fn append(&mut self, pattern: &str, transformer: impl ResponseTransformer + 'static) {
        self.entries.push(Arc::new(ChainEntry {
            pattern: MediaTypePattern::new(pattern),
            transformer: Arc::new(transformer),
        }));
    }

    /// Inserts a transformer at `index`, clamped to the chain length.
    pub fn insert(
        &mut self,
        index: usize,
        pattern: &str,
        transformer: impl ResponseTransformer + 'static,
    ) {
        let index = index.min(self.entries.len());
        self.entries.insert(
            index,
            Arc::new(ChainEntry {
                pattern: MediaTypePattern::new(pattern),
                transformer: Arc::new(transformer),
            }),
        );
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Runs every matching transformer in order. The first error
    /// short-circuits.
    pub fn process(&self, mut content: Content) -> Result<Content, TransformError> {
        for entry in &self.entries {
            if entry.pattern.matches(&content.content_type) {
                content = entry.transformer.transform(content)?;
            }
        }
        Ok(content)
    }
}

impl std::fmt::Debug for TransformerChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformerChain")
            .field("len", &self.entries.len())
            .finish()
    }
}

/// Parses `Bytes`/`Text` content into a [`serde_json::Value`].
pub struct JsonTransformer;

impl ResponseTransformer for JsonTransformer {
    fn transform(&self, content: Content) -> Result<Content, TransformError> {
        let value = match &content.value {
            ContentValue::Bytes(bytes) => serde_json::from_slice(bytes)
                .map_err(|e| TransformError::InvalidJson(e.to_string()))?,
            ContentValue::Text(text) => serde_json::from_str(text)
                .map_err(|e| TransformError::InvalidJson(e.to_string()))?,
            // Already parsed upstream; leave it alone.
            ContentValue::Json(_) => return Ok(content),
        };
        Ok(Content {
            value: ContentValue::Json(value),
            content_type: content.content_type,
        })
    }
}

/// Decodes `Bytes` content as UTF-8 text.
pub struct TextTransformer;

impl ResponseTransformer for TextTransformer {
    fn transform(&self, content: Content) -> Result<Content, TransformError> {
        let value = match content.value {
            ContentValue::Bytes(bytes) => {
                let text = String::from_utf8(bytes)
                    .map_err(|e| TransformError::InvalidEncoding(e.to_string()))?;
                ContentValue::Text(text)
            }
            other => other,
        };
        Ok(Content {
            value,
            content_type: content.content_type,
        })
    }
}

/// Guesses a content type from the leading bytes of a body.
///
/// Used when the response carries no `Content-Type` header (or an opaque
/// `application/octet-stream`). Leading `{`/`[` reads as JSON, `<` as XML,
/// any other valid UTF-8 as plain text.
pub fn sniff_content_type(body: &[u8]) -> &'static str {
    let first = body
        .iter()
        .copied()
        .find(|b| !b.is_ascii_whitespace());
    match first {
        Some(b'{') | Some(b'[') => "application/json",
        Some(b'<') => "application/xml",
        _ => {
            if std::str::from_utf8(body).is_ok() {
                "text/plain"
            } else {
                "application/octet-stream"
            }
        }
    }
}
