//! Layout JSON emitted by document-parsing models.
//!
//! The model answers with something like
//! `[{"bbox":[x1,y1,x2,y2],"category":"Text","text":"..."}, ...]`, sometimes
//! inside a markdown fence and often streamed a few characters at a time.
//! [`LayoutStreamParser`] yields each element as soon as its closing brace
//! arrives, so tokens are available before the whole reply is in.

use crate::recognizer::{BoundingBox, Token};
use serde::Deserialize;

/// Confidence assigned to layout elements; the model does not score them.
pub const LAYOUT_CONFIDENCE: f32 = 1.0;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LayoutElement {
    pub bbox: Vec<f64>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
}

impl LayoutElement {
    /// Converts into a token. Pictures, blank text and malformed boxes are dropped.
    pub fn into_token(self) -> Option<Token> {
        if self
            .category
            .as_deref()
            .is_some_and(|c| c.eq_ignore_ascii_case("picture"))
        {
            return None;
        }
        let text = self.text?.trim().to_string();
        if text.is_empty() {
            return None;
        }
        let [x1, y1, x2, y2] = self.bbox[..] else {
            return None;
        };
        let bbox = BoundingBox::from_corners(x1, y1, x2, y2)?;
        Some(Token::new(text, bbox, LAYOUT_CONFIDENCE))
    }
}

#[derive(Debug, Default)]
pub struct LayoutStreamParser {
    buf: String,
    scanned: usize,
    open_braces: Vec<usize>,
    in_string: bool,
    escaped: bool,
}

impl LayoutStreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a fragment and returns every element completed by it.
    pub fn feed(&mut self, fragment: &str) -> Vec<LayoutElement> {
        self.buf.push_str(fragment);
        let mut done = Vec::new();

        let bytes = self.buf.as_bytes();
        for idx in self.scanned..bytes.len() {
            let byte = bytes[idx];
            if self.in_string {
                match byte {
                    _ if self.escaped => self.escaped = false,
                    b'\\' => self.escaped = true,
                    b'"' => self.in_string = false,
                    _ => {}
                }
                continue;
            }
            match byte {
                b'"' => self.in_string = true,
                b'{' => self.open_braces.push(idx),
                b'}' => {
                    if let Some(start) = self.open_braces.pop() {
                        // wrapper objects without a bbox simply fail to deserialize
                        if let Ok(element) =
                            serde_json::from_str::<LayoutElement>(&self.buf[start..=idx])
                        {
                            done.push(element);
                        }
                    }
                }
                _ => {}
            }
        }
        self.scanned = self.buf.len();
        done
    }

    /// True once every opened object has been closed.
    pub fn is_balanced(&self) -> bool {
        self.open_braces.is_empty() && !self.in_string
    }
}

/// Parses a complete reply into tokens.
pub fn parse_layout(content: &str) -> Vec<Token> {
    LayoutStreamParser::new()
        .feed(content)
        .into_iter()
        .filter_map(LayoutElement::into_token)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPLY: &str = r#"```json
[{"bbox":[10,20,110,40],"category":"Title","text":"Quarterly {report}"},
 {"bbox":[0,50,200,300],"category":"Picture"},
 {"bbox":[10,320,90,340],"category":"Text","text":"Say \"hi\" \\ bye"},
 {"bbox":[10,350,90,360],"category":"Text","text":"   "}]
```"#;

    #[test]
    fn parses_fenced_reply() {
        let tokens = parse_layout(REPLY);
        assert_eq!(tokens.len(), 2);
        assert_eq!(tokens[0].text, "Quarterly {report}");
        assert_eq!(tokens[0].bbox, BoundingBox::new(10, 20, 100, 20));
        assert_eq!(tokens[0].confidence, LAYOUT_CONFIDENCE);
        assert_eq!(tokens[1].text, r#"Say "hi" \ bye"#);
    }

    #[test]
    fn elements_complete_incrementally() {
        let mut parser = LayoutStreamParser::new();
        let mut seen = Vec::new();
        for chunk in REPLY.as_bytes().chunks(3) {
            // REPLY is ASCII, so byte chunks are valid str slices
            let fragment = std::str::from_utf8(chunk).unwrap();
            seen.extend(parser.feed(fragment));
        }
        assert_eq!(seen.len(), 4);
        assert!(parser.is_balanced());
        assert_eq!(seen[1].category.as_deref(), Some("Picture"));
    }

    #[test]
    fn first_element_is_available_before_the_rest() {
        let mut parser = LayoutStreamParser::new();
        let first = parser.feed(r#"[{"bbox":[1,2,3,4],"text":"a"},{"bbox":[5,6"#);
        assert_eq!(first.len(), 1);
        assert!(!parser.is_balanced());
        let second = parser.feed(r#",7,8],"text":"b"}]"#);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].text.as_deref(), Some("b"));
    }

    #[test]
    fn wrapper_object_is_ignored() {
        let tokens = parse_layout(r#"{"layout":[{"bbox":[0,0,4,4],"text":"x"}]}"#);
        assert_eq!(tokens.len(), 1);
    }

    #[test]
    fn malformed_bbox_is_dropped() {
        assert!(parse_layout(r#"[{"bbox":[1,2,3],"text":"x"}]"#).is_empty());
    }
}
