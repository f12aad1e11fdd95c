//! Recursive-descent parser for filter expressions.

use super::{Comparator, FilterAtom, FilterNode, GeoFilter, ReferenceFilter};
use crate::config::DEFAULT_EXACT_FILTER_RADIUS_M;
use crate::error::{Error, Result};

/// Parses a filter expression into an owned tree.
pub fn parse_filter(input: &str) -> Result<FilterNode> {
    let mut cursor = Cursor::new(input);
    let node = parse_or(&mut cursor)?;
    cursor.skip_ws();
    if !cursor.at_end() {
        return Err(syntax_error(&cursor, "unexpected trailing input"));
    }
    Ok(node)
}

struct Cursor<'a> {
    chars: Vec<char>,
    pos: usize,
    input: &'a str,
}

impl<'a> Cursor<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            chars: input.chars().collect(),
            pos: 0,
            input,
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.chars.len()
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek();
        if c.is_some() {
            self.pos += 1;
        }
        c
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.pos += 1;
        }
    }

    fn eat(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_str(&mut self, s: &str) -> bool {
        let want: Vec<char> = s.chars().collect();
        if self.chars[self.pos..].starts_with(&want) {
            self.pos += want.len();
            true
        } else {
            false
        }
    }
}

fn syntax_error(cursor: &Cursor, what: &str) -> Error {
    Error::invalid(format!(
        "Could not parse the filter query: {} at position {} in `{}`.",
        what, cursor.pos, cursor.input
    ))
}

fn parse_or(cursor: &mut Cursor) -> Result<FilterNode> {
    let mut left = parse_and(cursor)?;
    loop {
        cursor.skip_ws();
        if cursor.eat_str("||") {
            let right = parse_and(cursor)?;
            left = left.or(right);
        } else {
            return Ok(left);
        }
    }
}

fn parse_and(cursor: &mut Cursor) -> Result<FilterNode> {
    let mut left = parse_term(cursor)?;
    loop {
        cursor.skip_ws();
        if cursor.eat_str("&&") {
            let right = parse_term(cursor)?;
            left = left.and(right);
        } else {
            return Ok(left);
        }
    }
}

fn parse_term(cursor: &mut Cursor) -> Result<FilterNode> {
    cursor.skip_ws();
    match cursor.peek() {
        Some('(') => {
            cursor.bump();
            let inner = parse_or(cursor)?;
            cursor.skip_ws();
            if !cursor.eat(')') {
                return Err(syntax_error(cursor, "expected `)`"));
            }
            Ok(inner)
        }
        Some('$') => parse_reference(cursor),
        Some(_) => parse_atom(cursor),
        None => Err(syntax_error(cursor, "expected a filter term")),
    }
}

fn parse_reference(cursor: &mut Cursor) -> Result<FilterNode> {
    cursor.bump(); // '$'
    let collection = parse_identifier(cursor)?;
    cursor.skip_ws();
    if !cursor.eat('(') {
        return Err(syntax_error(cursor, "expected `(` after reference collection"));
    }
    cursor.skip_ws();
    // `$ref(!= ...)` is a negate-join over the positive inner expression.
    let negate = cursor.eat_str("!=");
    let inner = parse_or(cursor)?;
    cursor.skip_ws();
    if !cursor.eat(')') {
        return Err(syntax_error(cursor, "expected `)` to close reference filter"));
    }

    let mut atom = FilterAtom::new(format!("${}", collection));
    atom.reference = Some(ReferenceFilter {
        collection,
        negate,
        inner: Box::new(inner),
        resolved_ref_ids: None,
    });
    Ok(FilterNode::Leaf(atom))
}

fn parse_identifier(cursor: &mut Cursor) -> Result<String> {
    cursor.skip_ws();
    let mut ident = String::new();
    while let Some(c) = cursor.peek() {
        if c.is_alphanumeric() || c == '_' || c == '.' || c == '-' {
            ident.push(c);
            cursor.bump();
        } else {
            break;
        }
    }
    if ident.is_empty() {
        return Err(syntax_error(cursor, "expected an identifier"));
    }
    Ok(ident)
}

fn parse_atom(cursor: &mut Cursor) -> Result<FilterNode> {
    let field = parse_identifier(cursor)?;
    cursor.skip_ws();
    if !cursor.eat(':') {
        return Err(syntax_error(cursor, "expected `:` after field name"));
    }
    cursor.skip_ws();

    let mut atom = FilterAtom::new(field);

    // Geo specs start with `(` and contain only numbers/units/commas.
    if cursor.peek() == Some('(') {
        parse_geo(cursor, &mut atom)?;
        return Ok(FilterNode::Leaf(atom));
    }

    let comparator = parse_comparator(cursor);
    cursor.skip_ws();

    if cursor.eat('[') {
        // Multi-value: every element carries the leading comparator.
        loop {
            cursor.skip_ws();
            let raw = parse_value(cursor, &[',', ']'])?;
            push_value(&mut atom, raw, comparator)?;
            cursor.skip_ws();
            if cursor.eat(']') {
                break;
            }
            if !cursor.eat(',') {
                return Err(syntax_error(cursor, "expected `,` or `]` in value list"));
            }
        }
    } else {
        let raw = parse_value(cursor, &[])?;
        if raw.is_empty() {
            return Err(syntax_error(cursor, "expected a filter value"));
        }
        push_value(&mut atom, raw, comparator)?;
    }

    if comparator == Comparator::NotEq {
        atom.apply_not_equals = true;
    }
    Ok(FilterNode::Leaf(atom))
}

fn parse_comparator(cursor: &mut Cursor) -> Comparator {
    if cursor.eat_str("!=") {
        Comparator::NotEq
    } else if cursor.eat_str(">=") {
        Comparator::Gte
    } else if cursor.eat_str("<=") {
        Comparator::Lte
    } else if cursor.eat('>') {
        Comparator::Gt
    } else if cursor.eat('<') {
        Comparator::Lt
    } else if cursor.eat('=') {
        Comparator::Eq
    } else {
        Comparator::Contains
    }
}

/// Splits `low..high` into two values under one `Range` comparator pair.
fn push_value(atom: &mut FilterAtom, raw: String, comparator: Comparator) -> Result<()> {
    if comparator == Comparator::Contains || comparator == Comparator::Eq {
        if let Some((low, high)) = raw.split_once("..") {
            if !low.is_empty() && !high.is_empty() {
                atom.values.push(low.trim().to_string());
                atom.values.push(high.trim().to_string());
                atom.comparators.push(Comparator::Range);
                atom.comparators.push(Comparator::Range);
                return Ok(());
            }
        }
    }
    atom.values.push(raw);
    atom.comparators.push(comparator);
    Ok(())
}

/// Reads a literal value up to a structural boundary. Backtick-quoted
/// values may contain any characters.
fn parse_value(cursor: &mut Cursor, extra_stops: &[char]) -> Result<String> {
    cursor.skip_ws();
    if cursor.eat('`') {
        let mut value = String::new();
        loop {
            match cursor.bump() {
                Some('`') => return Ok(value),
                Some(c) => value.push(c),
                None => return Err(syntax_error(cursor, "unterminated backtick value")),
            }
        }
    }

    let mut value = String::new();
    while let Some(c) = cursor.peek() {
        if c == ')' || extra_stops.contains(&c) {
            break;
        }
        // `&&` / `||` terminate an unquoted value.
        if (c == '&' && cursor.peek_at(1) == Some('&'))
            || (c == '|' && cursor.peek_at(1) == Some('|'))
        {
            break;
        }
        value.push(c);
        cursor.bump();
    }
    Ok(value.trim().to_string())
}

/// Geo atom bodies: `(lat, lng, radius unit)` or a polygon
/// `(lat, lng, lat, lng, ...)`, optionally followed by
/// `exact_filter_radius: N unit`.
fn parse_geo(cursor: &mut Cursor, atom: &mut FilterAtom) -> Result<()> {
    cursor.eat('(');
    let mut parts: Vec<String> = Vec::new();
    let mut current = String::new();
    loop {
        match cursor.bump() {
            Some(')') => {
                if !current.trim().is_empty() {
                    parts.push(current.trim().to_string());
                }
                break;
            }
            Some(',') => {
                parts.push(current.trim().to_string());
                current = String::new();
            }
            Some(c) => current.push(c),
            None => return Err(syntax_error(cursor, "unterminated geo filter")),
        }
    }

    let mut exact_radius_m = DEFAULT_EXACT_FILTER_RADIUS_M;
    if let Some(pos) = parts
        .iter()
        .position(|p| p.starts_with("exact_filter_radius"))
    {
        let spec = parts.remove(pos);
        let value = spec
            .split_once(':')
            .map(|(_, v)| v.trim())
            .ok_or_else(|| syntax_error(cursor, "malformed exact_filter_radius"))?;
        exact_radius_m = parse_distance_meters(value)?;
    }

    if parts.len() == 3 && parts[2].chars().any(|c| c.is_alphabetic()) {
        let lat = parse_coord(&parts[0], cursor)?;
        let lng = parse_coord(&parts[1], cursor)?;
        let radius_m = parse_distance_meters(&parts[2])?;
        if radius_m <= 0.0 {
            return Err(Error::invalid("Geo radius must be positive."));
        }
        atom.geo = Some(GeoFilter::Radius {
            lat,
            lng,
            radius_m,
            exact_radius_m,
        });
        return Ok(());
    }

    // Polygon: an even number (>= 6) of bare coordinates.
    if parts.len() >= 6 && parts.len() % 2 == 0 {
        let mut points = Vec::with_capacity(parts.len() / 2);
        for pair in parts.chunks(2) {
            points.push((parse_coord(&pair[0], cursor)?, parse_coord(&pair[1], cursor)?));
        }
        atom.geo = Some(GeoFilter::Polygon { points });
        return Ok(());
    }

    Err(Error::invalid(
        "A geo filter needs `(lat, lng, radius km|mi)` or a closed polygon of coordinates.",
    ))
}

fn parse_coord(raw: &str, cursor: &Cursor) -> Result<f64> {
    raw.trim()
        .parse::<f64>()
        .map_err(|_| syntax_error(cursor, "expected a numeric coordinate"))
}

/// Parses `5.1 km` / `3 mi` into meters.
pub fn parse_distance_meters(raw: &str) -> Result<f64> {
    let raw = raw.trim();
    let (num, unit) = raw
        .find(|c: char| c.is_alphabetic())
        .map(|i| raw.split_at(i))
        .ok_or_else(|| Error::invalid(format!("Distance `{}` is missing its unit.", raw)))?;
    let value: f64 = num
        .trim()
        .parse()
        .map_err(|_| Error::invalid(format!("Distance `{}` is not numeric.", raw)))?;
    if value <= 0.0 {
        return Err(Error::invalid("Distances must be positive."));
    }
    match unit.trim() {
        "km" => Ok(value * 1_000.0),
        "mi" => Ok(value * 1_609.34),
        other => Err(Error::invalid(format!(
            "Unit `{}` is not supported: use km or mi.",
            other
        ))),
    }
}
