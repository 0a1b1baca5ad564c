//! WGS84 two-dimensional geometry model with WKT support.
//!
//! Coordinates are longitude/latitude pairs in degrees. Only the geometry
//! kinds that can appear as a product footprint are modelled: points, line
//! strings, polygons and their multi-variants. Parsing and formatting use
//! well-known text with `EMPTY` support; all coordinates are 2-D.

use crate::error::{Error, Result};
use std::fmt;

/// A longitude/latitude coordinate pair.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn longitude(&self) -> f64 {
        self.x
    }

    pub fn latitude(&self) -> f64 {
        self.y
    }
}

/// An open sequence of two or more points.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LineString(pub Vec<Point>);

/// A closed ring. Stored without the closing point; WKT output repeats the
/// first point at the end, WKT input requires it.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LinearRing(pub Vec<Point>);

/// An exterior ring (counter-clockwise) plus zero or more interior rings.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Polygon(pub Vec<LinearRing>);

/// A product footprint or other 2-D geometry.
#[derive(Clone, Debug, PartialEq)]
pub enum Geometry {
    Point(Point),
    LineString(LineString),
    Polygon(Polygon),
    MultiPoint(Vec<Point>),
    MultiLineString(Vec<LineString>),
    MultiPolygon(Vec<Polygon>),
}

impl Geometry {
    /// Parse a tagged WKT string.
    pub fn from_wkt(text: &str) -> Result<Self> {
        let mut parser = WktParser::new(text);
        let geometry = parser.parse_geometry()?;
        parser.expect_end()?;
        Ok(geometry)
    }

    /// Render as tagged WKT.
    pub fn to_wkt(&self) -> String {
        self.to_string()
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Geometry::Point(_) => false,
            Geometry::LineString(line) => line.0.is_empty(),
            Geometry::Polygon(polygon) => polygon.0.is_empty(),
            Geometry::MultiPoint(points) => points.is_empty(),
            Geometry::MultiLineString(lines) => lines.is_empty(),
            Geometry::MultiPolygon(polygons) => polygons.is_empty(),
        }
    }
}

fn write_point_raw(f: &mut fmt::Formatter<'_>, point: &Point) -> fmt::Result {
    write!(f, "{} {}", point.x, point.y)
}

fn write_point_list(f: &mut fmt::Formatter<'_>, points: &[Point]) -> fmt::Result {
    write!(f, "(")?;
    for (index, point) in points.iter().enumerate() {
        if index > 0 {
            write!(f, ", ")?;
        }
        write_point_raw(f, point)?;
    }
    write!(f, ")")
}

fn write_ring(f: &mut fmt::Formatter<'_>, ring: &LinearRing) -> fmt::Result {
    if ring.0.is_empty() {
        return write!(f, "EMPTY");
    }
    write!(f, "(")?;
    for (index, point) in ring.0.iter().enumerate() {
        if index > 0 {
            write!(f, ", ")?;
        }
        write_point_raw(f, point)?;
    }
    // close the ring
    write!(f, ", ")?;
    write_point_raw(f, &ring.0[0])?;
    write!(f, ")")
}

fn write_polygon_body(f: &mut fmt::Formatter<'_>, polygon: &Polygon) -> fmt::Result {
    if polygon.0.is_empty() {
        return write!(f, "EMPTY");
    }
    write!(f, "(")?;
    for (index, ring) in polygon.0.iter().enumerate() {
        if index > 0 {
            write!(f, ", ")?;
        }
        write_ring(f, ring)?;
    }
    write!(f, ")")
}

impl fmt::Display for Geometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Geometry::Point(point) => {
                write!(f, "POINT (")?;
                write_point_raw(f, point)?;
                write!(f, ")")
            }
            Geometry::LineString(line) => {
                write!(f, "LINESTRING ")?;
                if line.0.is_empty() {
                    write!(f, "EMPTY")
                } else {
                    write_point_list(f, &line.0)
                }
            }
            Geometry::Polygon(polygon) => {
                write!(f, "POLYGON ")?;
                write_polygon_body(f, polygon)
            }
            Geometry::MultiPoint(points) => {
                write!(f, "MULTIPOINT ")?;
                if points.is_empty() {
                    return write!(f, "EMPTY");
                }
                write!(f, "(")?;
                for (index, point) in points.iter().enumerate() {
                    if index > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "(")?;
                    write_point_raw(f, point)?;
                    write!(f, ")")?;
                }
                write!(f, ")")
            }
            Geometry::MultiLineString(lines) => {
                write!(f, "MULTILINESTRING ")?;
                if lines.is_empty() {
                    return write!(f, "EMPTY");
                }
                write!(f, "(")?;
                for (index, line) in lines.iter().enumerate() {
                    if index > 0 {
                        write!(f, ", ")?;
                    }
                    write_point_list(f, &line.0)?;
                }
                write!(f, ")")
            }
            Geometry::MultiPolygon(polygons) => {
                write!(f, "MULTIPOLYGON ")?;
                if polygons.is_empty() {
                    return write!(f, "EMPTY");
                }
                write!(f, "(")?;
                for (index, polygon) in polygons.iter().enumerate() {
                    if index > 0 {
                        write!(f, ", ")?;
                    }
                    write_polygon_body(f, polygon)?;
                }
                write!(f, ")")
            }
        }
    }
}

/// Minimal recursive-descent WKT parser.
struct WktParser<'a> {
    text: &'a str,
    pos: usize,
}

impl<'a> WktParser<'a> {
    fn new(text: &'a str) -> Self {
        Self { text, pos: 0 }
    }

    fn error(&self, message: impl Into<String>) -> Error {
        Error::Expression(format!("char {}: {}", self.pos + 1, message.into()))
    }

    fn skip_whitespace(&mut self) {
        while self.pos < self.text.len()
            && self.text.as_bytes()[self.pos].is_ascii_whitespace()
        {
            self.pos += 1;
        }
    }

    fn peek(&mut self) -> Option<u8> {
        self.skip_whitespace();
        self.text.as_bytes().get(self.pos).copied()
    }

    fn accept(&mut self, byte: u8) -> bool {
        if self.peek() == Some(byte) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, byte: u8) -> Result<()> {
        if self.accept(byte) {
            Ok(())
        } else {
            Err(self.error(format!("expected '{}'", byte as char)))
        }
    }

    fn expect_end(&mut self) -> Result<()> {
        self.skip_whitespace();
        if self.pos != self.text.len() {
            return Err(self.error(format!(
                "extra characters after geometry: \"{}\"",
                &self.text[self.pos..]
            )));
        }
        Ok(())
    }

    fn word(&mut self) -> Option<&'a str> {
        self.skip_whitespace();
        let start = self.pos;
        while self.pos < self.text.len()
            && self.text.as_bytes()[self.pos].is_ascii_alphabetic()
        {
            self.pos += 1;
        }
        (self.pos > start).then(|| &self.text[start..self.pos])
    }

    fn parse_geometry(&mut self) -> Result<Geometry> {
        let tag = self
            .word()
            .ok_or_else(|| self.error("expected geometry tag"))?;
        match tag {
            "POINT" => {
                self.expect(b'(')?;
                let point = self.parse_point_raw()?;
                self.expect(b')')?;
                Ok(Geometry::Point(point))
            }
            "LINESTRING" => Ok(Geometry::LineString(self.parse_line_string()?)),
            "POLYGON" => Ok(Geometry::Polygon(self.parse_polygon()?)),
            "MULTIPOINT" => {
                let points = self.parse_sequence(|parser| {
                    parser.expect(b'(')?;
                    let point = parser.parse_point_raw()?;
                    parser.expect(b')')?;
                    Ok(point)
                })?;
                Ok(Geometry::MultiPoint(points))
            }
            "MULTILINESTRING" => Ok(Geometry::MultiLineString(
                self.parse_sequence(Self::parse_line_string)?,
            )),
            "MULTIPOLYGON" => Ok(Geometry::MultiPolygon(
                self.parse_sequence(Self::parse_polygon)?,
            )),
            other => Err(self.error(format!("unknown geometry tag: \"{other}\""))),
        }
    }

    /// `EMPTY` or a parenthesized comma-separated sequence of items.
    fn parse_sequence<T>(
        &mut self,
        mut parse_item: impl FnMut(&mut Self) -> Result<T>,
    ) -> Result<Vec<T>> {
        self.skip_whitespace();
        if self.text[self.pos..].starts_with("EMPTY") {
            self.pos += "EMPTY".len();
            return Ok(Vec::new());
        }
        self.expect(b'(')?;
        let mut items = vec![parse_item(self)?];
        while self.accept(b',') {
            items.push(parse_item(self)?);
        }
        self.expect(b')')?;
        Ok(items)
    }

    fn parse_point_raw(&mut self) -> Result<Point> {
        let x = self.parse_coordinate()?;
        let y = self.parse_coordinate()?;
        Ok(Point::new(x, y))
    }

    fn parse_coordinate(&mut self) -> Result<f64> {
        self.skip_whitespace();
        let start = self.pos;
        if matches!(self.text.as_bytes().get(self.pos), Some(b'+') | Some(b'-')) {
            self.pos += 1;
        }
        while self
            .text
            .as_bytes()
            .get(self.pos)
            .is_some_and(|b| b.is_ascii_digit() || *b == b'.' || *b == b'e' || *b == b'E')
        {
            // allow a sign directly after an exponent marker
            if matches!(self.text.as_bytes()[self.pos], b'e' | b'E')
                && matches!(self.text.as_bytes().get(self.pos + 1), Some(b'+') | Some(b'-'))
            {
                self.pos += 1;
            }
            self.pos += 1;
        }
        self.text[start..self.pos]
            .parse::<f64>()
            .map_err(|_| self.error("expected coordinate"))
    }

    fn parse_line_string(&mut self) -> Result<LineString> {
        Ok(LineString(self.parse_sequence(Self::parse_point_raw)?))
    }

    fn parse_linear_ring(&mut self) -> Result<LinearRing> {
        let points = self.parse_sequence(Self::parse_point_raw)?;
        if points.is_empty() {
            return Ok(LinearRing::default());
        }
        if points.len() < 4 {
            return Err(self.error("linear ring should be empty or should contain >= 4 points"));
        }
        if points.first() != points.last() {
            return Err(self.error("linear ring should be closed"));
        }
        Ok(LinearRing(points[..points.len() - 1].to_vec()))
    }

    fn parse_polygon(&mut self) -> Result<Polygon> {
        Ok(Polygon(self.parse_sequence(Self::parse_linear_ring)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn point_wkt_roundtrip() {
        let geometry = Geometry::from_wkt("POINT (4.5 52.3)").unwrap();
        assert_eq!(geometry, Geometry::Point(Point::new(4.5, 52.3)));
        assert_eq!(geometry.to_wkt(), "POINT (4.5 52.3)");
    }

    #[test]
    fn polygon_requires_ring_closure() {
        let open = "POLYGON ((0 0, 4 0, 4 4, 0 4))";
        assert!(Geometry::from_wkt(open).is_err());

        let closed = "POLYGON ((0 0, 4 0, 4 4, 0 4, 0 0))";
        let geometry = Geometry::from_wkt(closed).unwrap();
        match &geometry {
            Geometry::Polygon(polygon) => assert_eq!(polygon.0[0].0.len(), 4),
            other => panic!("expected polygon, got {other:?}"),
        }
        // formatting re-closes the ring
        assert_eq!(geometry.to_wkt(), closed);
    }

    #[test]
    fn short_ring_rejected() {
        assert!(Geometry::from_wkt("POLYGON ((0 0, 1 1, 0 0))").is_err());
    }

    #[test]
    fn empty_geometries() {
        for wkt in [
            "LINESTRING EMPTY",
            "POLYGON EMPTY",
            "MULTIPOINT EMPTY",
            "MULTILINESTRING EMPTY",
            "MULTIPOLYGON EMPTY",
        ] {
            let geometry = Geometry::from_wkt(wkt).unwrap();
            assert!(geometry.is_empty(), "{wkt} should parse as empty");
            assert_eq!(geometry.to_wkt(), wkt);
        }
    }

    #[test]
    fn multipoint_roundtrip() {
        let wkt = "MULTIPOINT ((1 2), (3 4))";
        let geometry = Geometry::from_wkt(wkt).unwrap();
        assert_eq!(
            geometry,
            Geometry::MultiPoint(vec![Point::new(1.0, 2.0), Point::new(3.0, 4.0)])
        );
        assert_eq!(geometry.to_wkt(), wkt);
    }

    #[test]
    fn negative_and_exponent_coordinates() {
        let geometry = Geometry::from_wkt("POINT (-4.5 1e2)").unwrap();
        assert_eq!(geometry, Geometry::Point(Point::new(-4.5, 100.0)));
    }

    #[test]
    fn trailing_garbage_rejected() {
        assert!(Geometry::from_wkt("POINT (1 2) tail").is_err());
    }
}
