//! Sorted views and record search.

use super::Store;
use crate::error::{Error, Result};
use crate::{Field, Record};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// How sort labels are compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Sensitivity {
    /// Case-insensitive
    #[default]
    Insensitive,
    /// Case-sensitive
    Sensitive,
    /// First character only, case-insensitive
    Mixed,
}

impl Sensitivity {
    pub fn code(&self) -> &'static str {
        match self {
            Sensitivity::Insensitive => "ci",
            Sensitivity::Sensitive => "cs",
            Sensitivity::Mixed => "ms",
        }
    }

    fn label(&self, text: &str) -> String {
        let text = text.trim();
        match self {
            Sensitivity::Insensitive => text.to_lowercase(),
            Sensitivity::Sensitive => text.to_string(),
            Sensitivity::Mixed => text.chars().take(1).flat_map(char::to_lowercase).collect(),
        }
    }
}

impl fmt::Display for Sensitivity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Sensitivity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ci" => Ok(Sensitivity::Insensitive),
            "cs" => Ok(Sensitivity::Sensitive),
            "ms" => Ok(Sensitivity::Mixed),
            other => Err(Error::invalid(format!("unknown sensitivity '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Clause {
    field: String,
    descending: bool,
}

fn parse_query(query: &str) -> Result<Vec<Clause>> {
    if query.trim().is_empty() {
        return Err(Error::invalid("sort query is empty"));
    }

    query
        .split(',')
        .map(|clause| {
            let mut parts = clause.split_whitespace();
            let field = parts
                .next()
                .ok_or_else(|| Error::invalid(format!("empty clause in '{}'", query)))?;
            let descending = match parts.next().map(str::to_ascii_lowercase).as_deref() {
                None | Some("asc") => false,
                Some("desc") => true,
                Some(other) => return Err(Error::invalid(format!("unknown direction '{}'", other))),
            };
            if parts.next().is_some() {
                return Err(Error::invalid(format!("malformed clause '{}'", clause.trim())));
            }
            Ok(Clause {
                field: field.to_string(),
                descending,
            })
        })
        .collect()
}

/// Numeric comparison when both sides are numbers, text otherwise.
fn compare(a: &str, b: &str) -> Ordering {
    match (a.parse::<f64>(), b.parse::<f64>()) {
        (Ok(x), Ok(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
        _ => a.cmp(b),
    }
}

struct Sorter<'a> {
    records: &'a [Record],
    key_field: Option<&'a str>,
    sensitivity: Sensitivity,
}

impl Sorter<'_> {
    fn text(&self, position: usize, field: &str) -> String {
        let record = &self.records[position];
        if self.key_field == Some(field) {
            return record.key.clone();
        }
        record.field(field).and_then(Field::text).unwrap_or_default()
    }

    /// Bucket `positions` by the first clause, order the buckets, and recurse
    /// into each multi-record bucket with the remaining clauses.
    fn sort(&self, positions: Vec<usize>, clauses: &[Clause]) -> Vec<usize> {
        let (clause, rest) = match clauses.split_first() {
            Some(split) => split,
            None => return positions,
        };

        let mut order: Vec<String> = Vec::new();
        let mut buckets: HashMap<String, Vec<usize>> = HashMap::new();
        for position in positions {
            let label = self.sensitivity.label(&self.text(position, &clause.field));
            buckets
                .entry(label.clone())
                .or_insert_with(|| {
                    order.push(label);
                    Vec::new()
                })
                .push(position);
        }

        order.sort_by(|a, b| compare(a, b));
        if clause.descending {
            order.reverse();
        }

        let mut sorted = Vec::new();
        for label in order {
            let mut bucket = buckets.remove(&label).unwrap_or_default();
            if bucket.len() > 1 {
                // Stable: equal raw values keep their relative order
                bucket.sort_by(|&a, &b| {
                    let ordering = compare(
                        self.text(a, &clause.field).trim(),
                        self.text(b, &clause.field).trim(),
                    );
                    if clause.descending {
                        ordering.reverse()
                    } else {
                        ordering
                    }
                });
                bucket = self.sort(bucket, rest);
            }
            sorted.extend(bucket);
        }
        sorted
    }
}

impl Store {
    /// Records ordered by a query such as `"name, age desc"`.
    ///
    /// Views are cached per query and sensitivity until the next mutation;
    /// `create` forces a rebuild.
    pub fn sort(&self, query: &str, create: bool, sensitivity: Sensitivity) -> Result<Vec<Record>> {
        let clauses = parse_query(query)?;
        let name = format!(
            "{}:{}",
            clauses
                .iter()
                .map(|c| format!("{}{}", c.field, if c.descending { " desc" } else { "" }))
                .collect::<Vec<_>>()
                .join(","),
            sensitivity.code()
        );

        self.engine.write(self.id, |s| {
            if !create {
                if let Some(view) = s.views.get(&name) {
                    return view.iter().filter_map(|&p| s.index.at(p).cloned()).collect();
                }
            }
            if s.index.is_empty() {
                return Vec::new();
            }

            let sorter = Sorter {
                records: s.index.records(),
                key_field: s.config.key.as_deref(),
                sensitivity,
            };
            let positions = sorter.sort((0..s.index.total()).collect(), &clauses);
            let records = positions.iter().map(|&p| s.index.records()[p].clone()).collect();

            tracing::debug!(store = %self.id, view = %name, "Built view");
            s.views.insert(name, positions);
            records
        })
    }

    /// Records with a field containing any of the comma-separated needles,
    /// case-insensitively.
    ///
    /// `haystack` names the fields searched; by default every primitive
    /// field is. Child stores are never searched.
    pub fn find(&self, needles: &str, haystack: Option<&str>) -> Result<Vec<Record>> {
        let needles: Vec<String> = needles
            .split(',')
            .map(|n| n.trim().to_lowercase())
            .filter(|n| !n.is_empty())
            .collect();
        if needles.is_empty() {
            return Err(Error::invalid("find needs at least one needle"));
        }
        let fields: Option<Vec<&str>> =
            haystack.map(|h| h.split(',').map(str::trim).filter(|f| !f.is_empty()).collect());

        let matches = |field: &Field| match field.text() {
            Some(text) => {
                let text = text.to_lowercase();
                needles.iter().any(|n| text.contains(n.as_str()))
            }
            None => false,
        };

        Ok(self.find_by(|record| match &fields {
            Some(fields) => fields.iter().filter_map(|f| record.field(f)).any(&matches),
            None => record
                .data
                .values()
                .filter(|f| matches!(f, Field::Primitive(v) if !v.is_null()))
                .any(&matches),
        }))
    }

    /// Records accepted by `predicate`, in record order.
    pub fn find_by(&self, predicate: impl Fn(&Record) -> bool) -> Vec<Record> {
        self.engine
            .read(self.id, |s| {
                s.index
                    .records()
                    .iter()
                    .filter(|r| predicate(r))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}
