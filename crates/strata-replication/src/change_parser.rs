//! Streaming osmChange parser.
//!
//! A change document is a root `osmChange` holding `create`, `modify` and `delete`
//! groups, each containing `node`, `way` and `relation` elements in edit order:
//!
//! ```xml
//! <osmChange version="0.6">
//!   <create>
//!     <node id="1" version="1" changeset="10" timestamp="2024-01-01T00:00:00Z"
//!           uid="7" user="mapper" lat="52.5" lon="13.4">
//!       <tag k="amenity" v="cafe"/>
//!     </node>
//!   </create>
//!   <delete>
//!     <way id="2" version="4" changeset="11" timestamp="2024-01-01T00:00:01Z"/>
//!   </delete>
//! </osmChange>
//! ```
//!
//! Elements are turned into [`ElementChange`] rows in document order and handed
//! to a [`RowSink`] every `batch_rows` rows, so peak memory does not grow with the
//! document size. `visible` is derived from content, not from the action group.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::io::{BufRead, BufReader};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use strata_core::element::{ElementType, TypedElementId};
use strata_core::geometry::point_to_compressible_wkb;

use crate::error::{ReplicationError, Result};
use crate::parquet_util::{ElementChange, Member};

/// Receives parsed rows in batches.
pub trait RowSink {
    /// Accepts the next batch of rows, in parse order.
    ///
    /// # Errors
    ///
    /// Returns an error if the rows cannot be stored.
    fn write_rows(&mut self, rows: &[ElementChange]) -> Result<()>;
}

impl RowSink for Vec<ElementChange> {
    fn write_rows(&mut self, rows: &[ElementChange]) -> Result<()> {
        self.extend_from_slice(rows);
        Ok(())
    }
}

/// Parses change documents into element-change rows.
#[derive(Debug, Clone, Copy)]
pub struct ChangeParser {
    precision: u32,
    batch_rows: usize,
}

impl ChangeParser {
    /// Creates a parser encoding points at `precision` decimal digits and
    /// flushing every `batch_rows` rows.
    #[must_use]
    pub fn new(precision: u32, batch_rows: usize) -> Self {
        Self {
            precision,
            batch_rows: batch_rows.max(1),
        }
    }

    /// Parses a gzip-compressed document.
    ///
    /// # Errors
    ///
    /// See [`ChangeParser::parse`].
    pub fn parse_gzip<S: RowSink>(&self, compressed: &[u8], sink: &mut S) -> Result<u64> {
        self.parse(BufReader::new(GzDecoder::new(compressed)), sink)
    }

    /// Parses a document, writing rows to `sink`. Returns the number of rows.
    ///
    /// # Errors
    ///
    /// Returns [`ReplicationError::MalformedDocument`] for invalid XML, unexpected
    /// structure or bad attribute values, [`ReplicationError::Core`] for unknown
    /// element kinds, and whatever `sink` returns.
    pub fn parse<R: BufRead, S: RowSink>(&self, input: R, sink: &mut S) -> Result<u64> {
        let mut reader = Reader::from_reader(input);
        reader.config_mut().trim_text(true);

        let mut document = Document::new(*self);
        let mut buf = Vec::new();
        loop {
            let event = reader.read_event_into(&mut buf).map_err(|e| {
                ReplicationError::malformed_document(format!(
                    "invalid XML at byte {}: {e}",
                    reader.buffer_position()
                ))
            })?;
            match event {
                Event::Start(start) => document.open(&start, false, sink)?,
                Event::Empty(start) => document.open(&start, true, sink)?,
                Event::End(_) => document.close(sink)?,
                Event::Eof => break,
                _ => {}
            }
            buf.clear();
        }

        document.finish(sink)
    }
}

/// Nesting levels of a change document.
const ROOT: usize = 0;
const ACTION: usize = 1;
const ELEMENT: usize = 2;
const CHILD: usize = 3;

struct Document {
    parser: ChangeParser,
    depth: usize,
    pending: Option<PendingElement>,
    rows: Vec<ElementChange>,
    parsed: u64,
}

impl Document {
    fn new(parser: ChangeParser) -> Self {
        Self {
            parser,
            depth: ROOT,
            pending: None,
            rows: Vec::with_capacity(parser.batch_rows.min(4096)),
            parsed: 0,
        }
    }

    fn open<S: RowSink>(&mut self, start: &BytesStart<'_>, empty: bool, sink: &mut S) -> Result<()> {
        let name = start.name();
        match self.depth {
            ROOT if name.as_ref() != b"osmChange" => {
                return Err(unexpected("root", name.as_ref()));
            }
            ACTION if !matches!(name.as_ref(), b"create" | b"modify" | b"delete") => {
                return Err(unexpected("action", name.as_ref()));
            }
            ELEMENT => {
                let kind = ElementType::from_bytes(name.as_ref())?;
                self.pending = Some(PendingElement::from_start(kind, start)?);
                if empty {
                    return self.complete_element(sink);
                }
            }
            CHILD => {
                if let Some(pending) = self.pending.as_mut() {
                    pending.add_child(start)?;
                }
            }
            _ => {}
        }

        if !empty {
            self.depth += 1;
        }
        Ok(())
    }

    fn close<S: RowSink>(&mut self, sink: &mut S) -> Result<()> {
        self.depth = self.depth.saturating_sub(1);
        if self.depth == ELEMENT {
            self.complete_element(sink)?;
        }
        Ok(())
    }

    fn complete_element<S: RowSink>(&mut self, sink: &mut S) -> Result<()> {
        let Some(pending) = self.pending.take() else {
            return Ok(());
        };
        self.rows.push(pending.into_row(self.parsed, self.parser.precision));
        self.parsed += 1;

        if self.rows.len() >= self.parser.batch_rows {
            self.flush(sink)?;
        }
        Ok(())
    }

    fn flush<S: RowSink>(&mut self, sink: &mut S) -> Result<()> {
        if !self.rows.is_empty() {
            sink.write_rows(&self.rows)?;
            self.rows.clear();
        }
        Ok(())
    }

    fn finish<S: RowSink>(mut self, sink: &mut S) -> Result<u64> {
        if self.depth != ROOT {
            return Err(ReplicationError::malformed_document(
                "document ended inside an open element",
            ));
        }
        self.flush(sink)?;
        Ok(self.parsed)
    }
}

fn unexpected(level: &str, name: &[u8]) -> ReplicationError {
    ReplicationError::malformed_document(format!(
        "unexpected {level} element <{}>",
        String::from_utf8_lossy(name)
    ))
}

/// An element whose children are still being read.
struct PendingElement {
    kind: ElementType,
    typed_id: TypedElementId,
    changeset_id: u64,
    version: u64,
    created_at: DateTime<Utc>,
    user_id: Option<u64>,
    display_name: Option<String>,
    lat: Option<f64>,
    lon: Option<f64>,
    tags: Option<BTreeMap<String, String>>,
    members: Option<Vec<Member>>,
}

impl PendingElement {
    fn from_start(kind: ElementType, start: &BytesStart<'_>) -> Result<Self> {
        let mut id = None;
        let mut version = None;
        let mut changeset_id = None;
        let mut created_at = None;
        let mut user_id = None;
        let mut display_name = None;
        let mut lat = None;
        let mut lon = None;

        for (key, value) in attributes(start)? {
            match key.as_slice() {
                b"id" => id = Some(parse_value::<i64>("id", &value)?),
                b"version" => version = Some(parse_value::<u64>("version", &value)?),
                b"changeset" => changeset_id = Some(parse_value::<u64>("changeset", &value)?),
                b"timestamp" => created_at = Some(parse_timestamp(&value)?),
                b"uid" => user_id = Some(parse_value::<u64>("uid", &value)?),
                b"user" => display_name = Some(value),
                b"lat" => lat = Some(parse_value::<f64>("lat", &value)?),
                b"lon" => lon = Some(parse_value::<f64>("lon", &value)?),
                _ => {}
            }
        }

        let required = |field: &str| {
            ReplicationError::malformed_document(format!("{kind} is missing attribute '{field}'"))
        };
        let id = id.ok_or_else(|| required("id"))?;

        Ok(Self {
            kind,
            typed_id: TypedElementId::new(kind, id)?,
            changeset_id: changeset_id.ok_or_else(|| required("changeset"))?,
            version: version.ok_or_else(|| required("version"))?,
            created_at: created_at.ok_or_else(|| required("timestamp"))?,
            user_id,
            display_name,
            lat,
            lon,
            tags: None,
            members: None,
        })
    }

    fn add_child(&mut self, start: &BytesStart<'_>) -> Result<()> {
        match (self.kind, start.name().as_ref()) {
            (_, b"tag") => {
                let mut key = None;
                let mut value = None;
                for (k, v) in attributes(start)? {
                    match k.as_slice() {
                        b"k" => key = Some(v),
                        b"v" => value = Some(v),
                        _ => {}
                    }
                }
                let (Some(key), Some(value)) = (key, value) else {
                    return Err(ReplicationError::malformed_document(format!(
                        "{} has a tag without k or v",
                        self.typed_id
                    )));
                };
                self.tags.get_or_insert_with(BTreeMap::new).insert(key, value);
            }
            (ElementType::Way, b"nd") => {
                let node_ref = attributes(start)?
                    .into_iter()
                    .find(|(k, _)| k == b"ref")
                    .ok_or_else(|| {
                        ReplicationError::malformed_document(format!(
                            "{} has a node reference without ref",
                            self.typed_id
                        ))
                    })?;
                let node_id = parse_value::<i64>("nd ref", &node_ref.1)?;
                self.members.get_or_insert_with(Vec::new).push(Member {
                    typed_id: TypedElementId::new(ElementType::Node, node_id)?,
                    role: None,
                });
            }
            (ElementType::Relation, b"member") => {
                let mut kind = None;
                let mut member_ref = None;
                let mut role = None;
                for (k, v) in attributes(start)? {
                    match k.as_slice() {
                        b"type" => kind = Some(ElementType::from_str(&v)?),
                        b"ref" => member_ref = Some(parse_value::<i64>("member ref", &v)?),
                        b"role" => role = Some(v),
                        _ => {}
                    }
                }
                let (Some(kind), Some(member_ref)) = (kind, member_ref) else {
                    return Err(ReplicationError::malformed_document(format!(
                        "{} has a member without type or ref",
                        self.typed_id
                    )));
                };
                self.members.get_or_insert_with(Vec::new).push(Member {
                    typed_id: TypedElementId::new(kind, member_ref)?,
                    role: Some(role.unwrap_or_default()),
                });
            }
            _ => {}
        }
        Ok(())
    }

    fn into_row(self, parse_order: u64, precision: u32) -> ElementChange {
        let point = match (self.kind, self.lon, self.lat) {
            (ElementType::Node, Some(lon), Some(lat)) => {
                Some(point_to_compressible_wkb(lon, lat, precision))
            }
            _ => None,
        };
        let visible = self.tags.is_some() || point.is_some() || self.members.is_some();

        ElementChange {
            parse_order,
            changeset_id: self.changeset_id,
            typed_id: self.typed_id,
            version: self.version,
            visible,
            tags: self.tags,
            point,
            members: self.members,
            created_at: self.created_at,
            user_id: self.user_id,
            display_name: self.display_name,
        }
    }
}

fn attributes(start: &BytesStart<'_>) -> Result<Vec<(Vec<u8>, String)>> {
    start
        .attributes()
        .map(|attr| {
            let attr = attr.map_err(|e| {
                ReplicationError::malformed_document(format!("invalid attribute: {e}"))
            })?;
            let value = attr.unescape_value().map_err(|e| {
                ReplicationError::malformed_document(format!("invalid attribute value: {e}"))
            })?;
            Ok((attr.key.as_ref().to_vec(), value.into_owned()))
        })
        .collect()
}

fn parse_value<T>(field: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    value.parse().map_err(|e| {
        ReplicationError::malformed_document(format!("invalid {field} {value:?}: {e}"))
    })
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| {
            ReplicationError::malformed_document(format!("invalid timestamp {value:?}: {e}"))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::geometry::wkb_to_point;

    fn parse(xml: &str) -> Result<Vec<ElementChange>> {
        let mut rows = Vec::new();
        ChangeParser::new(7, 2).parse(xml.as_bytes(), &mut rows)?;
        Ok(rows)
    }

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<osmChange version="0.6" generator="test">
  <create>
    <node id="1" version="1" changeset="10" timestamp="2024-01-01T00:00:00Z" uid="7" user="mapper" lat="52.5" lon="13.4">
      <tag k="amenity" v="cafe"/>
      <tag k="name" v="Caf&#233; &amp; Bar"/>
    </node>
    <way id="2" version="1" changeset="10" timestamp="2024-01-01T00:00:00Z" uid="7" user="mapper">
      <nd ref="1"/>
      <nd ref="-3"/>
    </way>
    <relation id="3" version="1" changeset="10" timestamp="2024-01-01T00:00:01Z">
      <member type="way" ref="2" role="outer"/>
      <member type="node" ref="1" role=""/>
    </relation>
  </create>
  <modify>
    <node id="4" version="2" changeset="11" timestamp="2024-01-01T00:00:02Z" lat="1.0" lon="2.0"/>
  </modify>
  <delete>
    <node id="5" version="3" changeset="12" timestamp="2024-01-01T00:00:03Z" uid="8" user="other"/>
  </delete>
</osmChange>"#;

    #[test]
    fn parses_elements_in_document_order() {
        let rows = parse(SAMPLE).unwrap();
        assert_eq!(rows.len(), 5);
        assert_eq!(
            rows.iter().map(|r| r.parse_order).collect::<Vec<_>>(),
            vec![0, 1, 2, 3, 4]
        );
        assert_eq!(rows[0].typed_id.to_string(), "node/1");
        assert_eq!(rows[1].typed_id.to_string(), "way/2");
        assert_eq!(rows[2].typed_id.to_string(), "relation/3");
    }

    #[test]
    fn node_carries_tags_point_and_user() {
        let rows = parse(SAMPLE).unwrap();
        let node = &rows[0];

        let tags = node.tags.as_ref().unwrap();
        assert_eq!(tags["amenity"], "cafe");
        assert_eq!(tags["name"], "Café & Bar");
        let (lon, lat) = wkb_to_point(node.point.as_ref().unwrap()).unwrap();
        assert!((lon - 13.4).abs() < 1e-7 && (lat - 52.5).abs() < 1e-7);
        assert_eq!(node.user_id, Some(7));
        assert_eq!(node.display_name.as_deref(), Some("mapper"));
        assert_eq!(node.changeset_id, 10);
        assert!(node.members.is_none());
    }

    #[test]
    fn way_members_are_node_refs_without_roles() {
        let rows = parse(SAMPLE).unwrap();
        let members = rows[1].members.as_ref().unwrap();

        assert_eq!(members.len(), 2);
        assert_eq!(members[0].typed_id.to_string(), "node/1");
        assert_eq!(members[1].typed_id.element_id(), -3);
        assert!(members.iter().all(|m| m.role.is_none()));
        assert!(rows[1].point.is_none());
    }

    #[test]
    fn relation_members_keep_type_and_role() {
        let rows = parse(SAMPLE).unwrap();
        let members = rows[2].members.as_ref().unwrap();

        assert_eq!(members[0].typed_id.to_string(), "way/2");
        assert_eq!(members[0].role.as_deref(), Some("outer"));
        assert_eq!(members[1].role.as_deref(), Some(""));
        assert!(rows[2].user_id.is_none());
    }

    #[test]
    fn visibility_is_derived_from_content() {
        let rows = parse(SAMPLE).unwrap();
        // Modified node with only coordinates is visible.
        assert!(rows[3].visible);
        assert!(rows[3].tags.is_none());
        // Deleted node without content is not.
        assert!(!rows[4].visible);
        assert_eq!(rows[4].version, 3);
    }

    #[test]
    fn flushes_in_batches() {
        struct Batches(Vec<usize>);
        impl RowSink for Batches {
            fn write_rows(&mut self, rows: &[ElementChange]) -> Result<()> {
                self.0.push(rows.len());
                Ok(())
            }
        }

        let mut sink = Batches(Vec::new());
        let count = ChangeParser::new(7, 2)
            .parse(SAMPLE.as_bytes(), &mut sink)
            .unwrap();
        assert_eq!(count, 5);
        assert_eq!(sink.0, vec![2, 2, 1]);
    }

    #[test]
    fn empty_document_yields_no_rows() {
        assert!(parse(r#"<osmChange version="0.6"/>"#).unwrap().is_empty());
        assert!(parse("<osmChange><create/><delete></delete></osmChange>")
            .unwrap()
            .is_empty());
    }

    #[test]
    fn unknown_element_kind_is_fatal() {
        let err = parse(
            r#"<osmChange><create><area id="1" version="1" changeset="1" timestamp="2024-01-01T00:00:00Z"/></create></osmChange>"#,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ReplicationError::Core(strata_core::Error::UnsupportedElementType { .. })
        ));
    }

    #[test]
    fn structural_problems_are_malformed() {
        for xml in [
            "<osm><create/></osm>",
            "<osmChange><upsert/></osmChange>",
            r#"<osmChange><create><node id="1" version="1" timestamp="2024-01-01T00:00:00Z"/></create></osmChange>"#,
            r#"<osmChange><create><node id="x" version="1" changeset="1" timestamp="2024-01-01T00:00:00Z"/></create></osmChange>"#,
            "<osmChange><create>",
        ] {
            let err = parse(xml).unwrap_err();
            assert!(
                matches!(err, ReplicationError::MalformedDocument { .. }),
                "{xml}: {err}"
            );
        }
    }

    #[test]
    fn reads_gzip_input() {
        use std::io::Write;

        let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
        encoder.write_all(SAMPLE.as_bytes()).unwrap();
        let compressed = encoder.finish().unwrap();

        let mut rows = Vec::new();
        let count = ChangeParser::new(7, 100)
            .parse_gzip(&compressed, &mut rows)
            .unwrap();
        assert_eq!(count, 5);
        assert_eq!(rows.len(), 5);
    }
}
