//! Builders for change documents.
//!
//! ```rust,ignore
//! let diff = OsmChangeBuilder::new()
//!     .create(ElementXml::node(1, 1, "2024-01-01T00:00:00Z").coords(51.5, -0.1).tag("amenity", "cafe"))
//!     .delete(ElementXml::way(7, 3, "2024-01-01T00:00:05Z"))
//!     .gzip();
//! ```

use std::fmt::Write as _;
use std::io::Write as _;

use flate2::Compression;
use flate2::write::GzEncoder;

/// Gzip-compresses `data`.
pub fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).expect("gzip write");
    encoder.finish().expect("gzip finish")
}

fn escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// One element of a change document.
#[derive(Debug, Clone)]
pub struct ElementXml {
    kind: &'static str,
    id: i64,
    version: u64,
    timestamp: String,
    changeset: u64,
    user: Option<(u64, String)>,
    coords: Option<(f64, f64)>,
    tags: Vec<(String, String)>,
    children: Vec<String>,
}

impl ElementXml {
    fn new(kind: &'static str, id: i64, version: u64, timestamp: &str) -> Self {
        Self {
            kind,
            id,
            version,
            timestamp: timestamp.to_string(),
            changeset: 1,
            user: None,
            coords: None,
            tags: Vec::new(),
            children: Vec::new(),
        }
    }

    /// A node.
    pub fn node(id: i64, version: u64, timestamp: &str) -> Self {
        Self::new("node", id, version, timestamp)
    }

    /// A way.
    pub fn way(id: i64, version: u64, timestamp: &str) -> Self {
        Self::new("way", id, version, timestamp)
    }

    /// A relation.
    pub fn relation(id: i64, version: u64, timestamp: &str) -> Self {
        Self::new("relation", id, version, timestamp)
    }

    /// Sets the changeset id (default 1).
    #[must_use]
    pub fn changeset(mut self, changeset: u64) -> Self {
        self.changeset = changeset;
        self
    }

    /// Sets the editing user.
    #[must_use]
    pub fn user(mut self, uid: u64, name: &str) -> Self {
        self.user = Some((uid, name.to_string()));
        self
    }

    /// Sets node coordinates.
    #[must_use]
    pub fn coords(mut self, lat: f64, lon: f64) -> Self {
        self.coords = Some((lat, lon));
        self
    }

    /// Adds a tag.
    #[must_use]
    pub fn tag(mut self, key: &str, value: &str) -> Self {
        self.tags.push((key.to_string(), value.to_string()));
        self
    }

    /// Adds a way node reference.
    #[must_use]
    pub fn nd(mut self, node_id: i64) -> Self {
        self.children.push(format!(r#"<nd ref="{node_id}"/>"#));
        self
    }

    /// Adds a relation member.
    #[must_use]
    pub fn member(mut self, kind: &str, id: i64, role: &str) -> Self {
        self.children.push(format!(
            r#"<member type="{kind}" ref="{id}" role="{}"/>"#,
            escape(role)
        ));
        self
    }

    fn write_to(&self, out: &mut String) {
        let _ = write!(
            out,
            r#"<{} id="{}" version="{}" timestamp="{}" changeset="{}""#,
            self.kind, self.id, self.version, self.timestamp, self.changeset
        );
        if let Some((uid, name)) = &self.user {
            let _ = write!(out, r#" uid="{uid}" user="{}""#, escape(name));
        }
        if let Some((lat, lon)) = self.coords {
            let _ = write!(out, r#" lat="{lat}" lon="{lon}""#);
        }
        if self.tags.is_empty() && self.children.is_empty() {
            out.push_str("/>");
            return;
        }
        out.push('>');
        for child in &self.children {
            out.push_str(child);
        }
        for (key, value) in &self.tags {
            let _ = write!(out, r#"<tag k="{}" v="{}"/>"#, escape(key), escape(value));
        }
        let _ = write!(out, "</{}>", self.kind);
    }
}

/// Builds a change document action by action.
#[derive(Debug, Clone, Default)]
pub struct OsmChangeBuilder {
    actions: Vec<(&'static str, ElementXml)>,
}

impl OsmChangeBuilder {
    /// Starts an empty document.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a `create` action.
    #[must_use]
    pub fn create(mut self, element: ElementXml) -> Self {
        self.actions.push(("create", element));
        self
    }

    /// Adds a `modify` action.
    #[must_use]
    pub fn modify(mut self, element: ElementXml) -> Self {
        self.actions.push(("modify", element));
        self
    }

    /// Adds a `delete` action.
    #[must_use]
    pub fn delete(mut self, element: ElementXml) -> Self {
        self.actions.push(("delete", element));
        self
    }

    /// Renders the document. Consecutive elements of one action share a group.
    pub fn build(&self) -> String {
        let mut out = String::from(
            r#"<?xml version="1.0" encoding="UTF-8"?><osmChange version="0.6" generator="strata-test-utils">"#,
        );
        let mut open: Option<&str> = None;
        for (action, element) in &self.actions {
            if open != Some(*action) {
                if let Some(previous) = open {
                    let _ = write!(out, "</{previous}>");
                }
                let _ = write!(out, "<{action}>");
                open = Some(action);
            }
            element.write_to(&mut out);
        }
        if let Some(previous) = open {
            let _ = write!(out, "</{previous}>");
        }
        out.push_str("</osmChange>");
        out
    }

    /// Renders and gzip-compresses the document.
    pub fn gzip(&self) -> Vec<u8> {
        gzip(self.build().as_bytes())
    }
}
