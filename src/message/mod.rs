//! Message layer: balanced markup fragments.
//!
//! Devices answer with newline-free markup such as `<reply code="0"/>`. The
//! [`MessageFramer`] pulls complete fragments out of the byte stream, whether
//! the bytes come straight from the channel or from ARQ payloads.

mod framer;
mod scan;

use std::fmt;
use std::ops::Range;

pub use framer::MessageFramer;

/// One complete, well-formed markup fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    text: String,
    name: Range<usize>,
}

impl Fragment {
    /// Validates `raw` as a standalone document.
    ///
    /// `name` is the byte range of the root tag name within `raw`.
    pub(crate) fn parse(raw: &[u8], name: Range<usize>) -> Result<Self, String> {
        let text = std::str::from_utf8(raw).map_err(|e| e.to_string())?;
        roxmltree::Document::parse(text).map_err(|e| e.to_string())?;
        if text.get(name.clone()).is_none() {
            return Err("root name out of bounds".into());
        }
        Ok(Self {
            text: text.to_owned(),
            name,
        })
    }

    /// Returns the fragment text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Returns the qualified root tag name, e.g. `m:reply`.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.text[self.name.clone()]
    }

    /// Returns the root tag name without its prefix.
    #[must_use]
    pub fn local_name(&self) -> &str {
        let name = self.name();
        name.rsplit_once(':').map_or(name, |(_, local)| local)
    }

    /// Returns the length of the fragment in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.text.len()
    }

    /// Returns true if the fragment is empty (never the case for parsed fragments).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// Parses the fragment into a read-only tree.
    ///
    /// # Errors
    ///
    /// Never fails for fragments produced by [`MessageFramer`].
    pub fn document(&self) -> Result<roxmltree::Document<'_>, roxmltree::Error> {
        roxmltree::Document::parse(&self.text)
    }

    /// Returns an attribute of the root element.
    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<String> {
        let doc = self.document().ok()?;
        doc.root_element().attribute(name).map(str::to_owned)
    }

    /// Consumes the fragment, returning its text.
    #[must_use]
    pub fn into_string(self) -> String {
        self.text
    }
}

impl fmt::Display for Fragment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fragment_accessors() {
        let raw = b"<reply code='4' text='busy'/>";
        let fragment = Fragment::parse(raw, 1..6).unwrap();
        assert_eq!(fragment.name(), "reply");
        assert_eq!(fragment.local_name(), "reply");
        assert_eq!(fragment.attribute("code").as_deref(), Some("4"));
        assert_eq!(fragment.attribute("missing"), None);
        assert_eq!(fragment.to_string(), "<reply code='4' text='busy'/>");
        assert_eq!(fragment.len(), raw.len());
    }

    #[test]
    fn test_document_access() {
        let fragment = Fragment::parse(b"<r><v>12.5</v></r>", 1..2).unwrap();
        let doc = fragment.document().unwrap();
        let value = doc
            .descendants()
            .find(|n| n.has_tag_name("v"))
            .and_then(|n| n.text());
        assert_eq!(value, Some("12.5"));
    }

    #[test]
    fn test_parse_rejects_broken_markup() {
        assert!(Fragment::parse(b"<a>&nope;</a>", 1..2).is_err());
        assert!(Fragment::parse(b"<a>\xff</a>", 1..2).is_err());
    }
}
