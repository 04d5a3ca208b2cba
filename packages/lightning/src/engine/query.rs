//! Typed query parameters.
//!
//! Queries arrive as JSON (`{table, where?, include?, take?, skip?, orderBy?}`) and are
//! parsed once into the types below. Every type serializes back to the same JSON shape,
//! which is what the DataStore, the wire and shape hashing see.

use super::types::DbValue;
use crate::error::{Error, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use smol_str::SmolStr;

/// Keys that make an object a field filter rather than a nested relation where.
pub const FILTER_OPERATORS: &[&str] = &[
    "equals",
    "in",
    "notIn",
    "lt",
    "lte",
    "gt",
    "gte",
    "contains",
    "startsWith",
    "endsWith",
    "mode",
    "some",
    "every",
    "none",
    "has",
    "hasEvery",
    "hasSome",
    "isEmpty",
];

const RELATION_OPERATORS: &[&str] = &["some", "every", "none"];

fn invalid(msg: impl Into<String>) -> Error {
    Error::InvalidQuery(msg.into())
}

// ---------------------------------------------------------------------------
// Where
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryMode {
    #[default]
    Default,
    Insensitive,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operator {
    Equals(DbValue),
    In(Vec<DbValue>),
    NotIn(Vec<DbValue>),
    Lt(DbValue),
    Lte(DbValue),
    Gt(DbValue),
    Gte(DbValue),
    Contains(SmolStr),
    StartsWith(SmolStr),
    EndsWith(SmolStr),
    Has(DbValue),
    HasEvery(Vec<DbValue>),
    HasSome(Vec<DbValue>),
    IsEmpty(bool),
}

impl Operator {
    pub fn name(&self) -> &'static str {
        match self {
            Operator::Equals(_) => "equals",
            Operator::In(_) => "in",
            Operator::NotIn(_) => "notIn",
            Operator::Lt(_) => "lt",
            Operator::Lte(_) => "lte",
            Operator::Gt(_) => "gt",
            Operator::Gte(_) => "gte",
            Operator::Contains(_) => "contains",
            Operator::StartsWith(_) => "startsWith",
            Operator::EndsWith(_) => "endsWith",
            Operator::Has(_) => "has",
            Operator::HasEvery(_) => "hasEvery",
            Operator::HasSome(_) => "hasSome",
            Operator::IsEmpty(_) => "isEmpty",
        }
    }

    fn parse(name: &str, operand: Value) -> Result<Self> {
        let list = |v: Value| -> Result<Vec<DbValue>> {
            match v {
                Value::Array(items) => Ok(items.into_iter().map(DbValue::from).collect()),
                other => Err(invalid(format!("`{name}` expects a list, got {other}"))),
            }
        };
        let text = |v: Value| -> Result<SmolStr> {
            match v {
                Value::String(s) => Ok(SmolStr::from(s)),
                other => Err(invalid(format!("`{name}` expects a string, got {other}"))),
            }
        };

        Ok(match name {
            "equals" => Operator::Equals(operand.into()),
            "in" => Operator::In(list(operand)?),
            "notIn" => Operator::NotIn(list(operand)?),
            "lt" => Operator::Lt(operand.into()),
            "lte" => Operator::Lte(operand.into()),
            "gt" => Operator::Gt(operand.into()),
            "gte" => Operator::Gte(operand.into()),
            "contains" => Operator::Contains(text(operand)?),
            "startsWith" => Operator::StartsWith(text(operand)?),
            "endsWith" => Operator::EndsWith(text(operand)?),
            "has" => Operator::Has(operand.into()),
            "hasEvery" => Operator::HasEvery(list(operand)?),
            "hasSome" => Operator::HasSome(list(operand)?),
            "isEmpty" => match operand {
                Value::Bool(b) => Operator::IsEmpty(b),
                other => return Err(invalid(format!("`isEmpty` expects a bool, got {other}"))),
            },
            other => return Err(invalid(format!("unknown operator `{other}`"))),
        })
    }

    fn to_json(&self) -> Value {
        let list = |items: &Vec<DbValue>| Value::Array(items.iter().cloned().map(Value::from).collect());
        match self {
            Operator::Equals(v)
            | Operator::Lt(v)
            | Operator::Lte(v)
            | Operator::Gt(v)
            | Operator::Gte(v)
            | Operator::Has(v) => v.clone().into(),
            Operator::In(items)
            | Operator::NotIn(items)
            | Operator::HasEvery(items)
            | Operator::HasSome(items) => list(items),
            Operator::Contains(s) | Operator::StartsWith(s) | Operator::EndsWith(s) => {
                Value::String(s.to_string())
            }
            Operator::IsEmpty(b) => Value::Bool(*b),
        }
    }
}

/// `{some?, every?, none?}` over a relation. Present operators are conjoined.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RelationFilter {
    pub some: Option<Where>,
    pub every: Option<Where>,
    pub none: Option<Where>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldFilter {
    /// Scalar (or list, or null) compared for equality.
    Equals(DbValue),
    /// Operators of one family, conjoined.
    Ops { ops: Vec<Operator>, mode: QueryMode },
    /// `some` / `every` / `none` over a relation.
    Relation(RelationFilter),
    /// Object with no recognized operator: a where applied to the related record.
    Nested(Where),
}

/// Conjunction of field predicates, in declaration order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Where {
    pub fields: Vec<(SmolStr, FieldFilter)>,
}

impl Where {
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn get(&self, field: &str) -> Option<&FieldFilter> {
        self.fields
            .iter()
            .find(|(name, _)| name == field)
            .map(|(_, filter)| filter)
    }

    /// Merge `other` into `self`; fields of `other` replace same-named fields.
    pub fn merge(&mut self, other: Where) {
        for (name, filter) in other.fields {
            match self.fields.iter_mut().find(|(n, _)| *n == name) {
                Some(slot) => slot.1 = filter,
                None => self.fields.push((name, filter)),
            }
        }
    }

    pub fn field(mut self, name: &str, filter: FieldFilter) -> Self {
        self.merge(Where {
            fields: vec![(SmolStr::new(name), filter)],
        });
        self
    }

    pub fn from_json(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Self::from_map(map),
            Value::Null => Ok(Where::default()),
            other => Err(invalid(format!("`where` must be an object, got {other}"))),
        }
    }

    fn from_map(map: Map<String, Value>) -> Result<Self> {
        let mut fields = Vec::with_capacity(map.len());
        for (name, value) in map {
            let filter = FieldFilter::parse(&name, value)?;
            fields.push((SmolStr::from(name), filter));
        }
        Ok(Where { fields })
    }

    pub fn to_json(&self) -> Value {
        let mut map = Map::with_capacity(self.fields.len());
        for (name, filter) in &self.fields {
            map.insert(name.to_string(), filter.to_json());
        }
        Value::Object(map)
    }
}

impl FieldFilter {
    fn parse(field: &str, value: Value) -> Result<Self> {
        let map = match value {
            Value::Object(map) => map,
            scalar => return Ok(FieldFilter::Equals(scalar.into())),
        };

        let recognized = map.keys().all(|k| FILTER_OPERATORS.contains(&k.as_str()));
        if !recognized {
            return Ok(FieldFilter::Nested(Where::from_map(map)?));
        }

        let relational = map.keys().filter(|k| RELATION_OPERATORS.contains(&k.as_str())).count();
        if relational > 0 {
            if relational != map.len() {
                return Err(invalid(format!(
                    "`{field}` mixes relation operators with field operators"
                )));
            }
            let mut rel = RelationFilter::default();
            for (op, inner) in map {
                let inner = Where::from_json(inner)?;
                match op.as_str() {
                    "some" => rel.some = Some(inner),
                    "every" => rel.every = Some(inner),
                    _ => rel.none = Some(inner),
                }
            }
            return Ok(FieldFilter::Relation(rel));
        }

        let mut mode = QueryMode::Default;
        let mut ops = Vec::with_capacity(map.len());
        for (name, operand) in map {
            if name == "mode" {
                mode = match operand.as_str() {
                    Some("insensitive") => QueryMode::Insensitive,
                    Some("default") => QueryMode::Default,
                    _ => return Err(invalid(format!("`{field}.mode` must be default|insensitive"))),
                };
                continue;
            }
            ops.push(Operator::parse(&name, operand)?);
        }
        Ok(FieldFilter::Ops { ops, mode })
    }

    fn to_json(&self) -> Value {
        match self {
            FieldFilter::Equals(v) => v.clone().into(),
            FieldFilter::Ops { ops, mode } => {
                let mut map = Map::with_capacity(ops.len() + 1);
                for op in ops {
                    map.insert(op.name().to_string(), op.to_json());
                }
                if *mode == QueryMode::Insensitive {
                    map.insert("mode".into(), Value::String("insensitive".into()));
                }
                Value::Object(map)
            }
            FieldFilter::Relation(rel) => {
                let mut map = Map::new();
                if let Some(w) = &rel.some {
                    map.insert("some".into(), w.to_json());
                }
                if let Some(w) = &rel.every {
                    map.insert("every".into(), w.to_json());
                }
                if let Some(w) = &rel.none {
                    map.insert("none".into(), w.to_json());
                }
                Value::Object(map)
            }
            FieldFilter::Nested(w) => w.to_json(),
        }
    }

    /// `{in: [..]}` shorthand.
    pub fn one_of(values: Vec<DbValue>) -> Self {
        FieldFilter::Ops {
            ops: vec![Operator::In(values)],
            mode: QueryMode::Default,
        }
    }
}

// ---------------------------------------------------------------------------
// OrderBy / Include / QueryParams
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    Desc,
}

/// Sort entries in declaration order. Accepts `{a: "asc"}` or `[{a: "asc"}, {b: "desc"}]`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct OrderBy(pub Vec<(SmolStr, SortOrder)>);

impl OrderBy {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn from_json(value: Value) -> Result<Self> {
        let mut entries = Vec::new();
        let mut push_object = |map: Map<String, Value>| -> Result<()> {
            for (field, dir) in map {
                let order: SortOrder = serde_json::from_value(dir)
                    .map_err(|_| invalid(format!("`orderBy.{field}` must be asc|desc")))?;
                entries.push((SmolStr::from(field), order));
            }
            Ok(())
        };
        match value {
            Value::Object(map) => push_object(map)?,
            Value::Array(items) => {
                for item in items {
                    match item {
                        Value::Object(map) => push_object(map)?,
                        other => return Err(invalid(format!("bad `orderBy` entry {other}"))),
                    }
                }
            }
            Value::Null => {}
            other => return Err(invalid(format!("bad `orderBy` {other}"))),
        }
        Ok(OrderBy(entries))
    }

    fn to_json(&self) -> Value {
        let entry = |(field, order): &(SmolStr, SortOrder)| {
            let mut map = Map::new();
            map.insert(field.to_string(), serde_json::json!(order));
            map
        };
        let unique = {
            let mut seen: Vec<&SmolStr> = Vec::new();
            self.0.iter().all(|(f, _)| {
                let fresh = !seen.contains(&f);
                seen.push(f);
                fresh
            })
        };
        if unique {
            let mut map = Map::new();
            for e in &self.0 {
                map.extend(entry(e));
            }
            Value::Object(map)
        } else {
            Value::Array(self.0.iter().map(|e| Value::Object(entry(e))).collect())
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Include {
    /// `true` attaches every candidate, `false` nothing.
    Flag(bool),
    Nested(Box<QueryParams>),
}

impl Include {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, Include::Flag(false))
    }

    pub fn params(&self) -> Option<&QueryParams> {
        match self {
            Include::Nested(params) => Some(params),
            Include::Flag(_) => None,
        }
    }
}

/// `relationName -> Include`, in declaration order.
pub type IncludeSpec = IndexMap<SmolStr, Include>;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct QueryParams {
    pub r#where: Option<Where>,
    pub include: IncludeSpec,
    pub take: Option<usize>,
    pub skip: Option<usize>,
    pub order_by: OrderBy,
}

impl QueryParams {
    pub fn with_where(mut self, w: Where) -> Self {
        self.r#where = Some(w);
        self
    }

    /// The where clause, if it constrains anything.
    pub fn filter(&self) -> Option<&Where> {
        self.r#where.as_ref().filter(|w| !w.is_empty())
    }

    pub fn from_json(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Self::from_map(map),
            Value::Bool(_) | Value::Null => Ok(QueryParams::default()),
            other => Err(invalid(format!("query params must be an object, got {other}"))),
        }
    }

    fn from_map(map: Map<String, Value>) -> Result<Self> {
        let mut params = QueryParams::default();
        for (key, value) in map {
            match key.as_str() {
                "where" => params.r#where = Some(Where::from_json(value)?),
                "include" => params.include = parse_include(value)?,
                "take" => params.take = parse_count("take", value)?,
                "skip" => params.skip = parse_count("skip", value)?,
                "orderBy" => params.order_by = OrderBy::from_json(value)?,
                // `table` is handled by TableQuery; other Prisma args are not interpreted.
                _ => {}
            }
        }
        Ok(params)
    }

    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        self.write_into(&mut map);
        Value::Object(map)
    }

    fn write_into(&self, map: &mut Map<String, Value>) {
        if let Some(w) = &self.r#where {
            map.insert("where".into(), w.to_json());
        }
        if !self.include.is_empty() {
            let mut inc = Map::new();
            for (name, include) in &self.include {
                let v = match include {
                    Include::Flag(b) => Value::Bool(*b),
                    Include::Nested(p) => p.to_json(),
                };
                inc.insert(name.to_string(), v);
            }
            map.insert("include".into(), Value::Object(inc));
        }
        if let Some(take) = self.take {
            map.insert("take".into(), take.into());
        }
        if let Some(skip) = self.skip {
            map.insert("skip".into(), skip.into());
        }
        if !self.order_by.is_empty() {
            map.insert("orderBy".into(), self.order_by.to_json());
        }
    }
}

fn parse_include(value: Value) -> Result<IncludeSpec> {
    let map = match value {
        Value::Object(map) => map,
        Value::Null => return Ok(IncludeSpec::new()),
        other => return Err(invalid(format!("`include` must be an object, got {other}"))),
    };
    let mut spec = IncludeSpec::with_capacity(map.len());
    for (name, value) in map {
        let include = match value {
            Value::Bool(b) => Include::Flag(b),
            Value::Object(inner) => Include::Nested(Box::new(QueryParams::from_map(inner)?)),
            other => return Err(invalid(format!("`include.{name}` must be bool or object, got {other}"))),
        };
        spec.insert(SmolStr::from(name), include);
    }
    Ok(spec)
}

fn parse_count(name: &str, value: Value) -> Result<Option<usize>> {
    match value {
        Value::Null => Ok(None),
        Value::Number(n) => n
            .as_u64()
            .map(|n| Some(n as usize))
            .ok_or_else(|| invalid(format!("`{name}` must be a non-negative integer"))),
        other => Err(invalid(format!("`{name}` must be a number, got {other}"))),
    }
}

impl TryFrom<Value> for QueryParams {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self> {
        QueryParams::from_json(value)
    }
}

impl From<QueryParams> for Value {
    fn from(params: QueryParams) -> Self {
        params.to_json()
    }
}

/// `{table, ...QueryParams}` as sent by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct TableQuery {
    pub table: SmolStr,
    pub params: QueryParams,
}

impl TableQuery {
    pub fn new(table: &str, params: QueryParams) -> Self {
        Self {
            table: SmolStr::new(table),
            params,
        }
    }

    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        map.insert("table".into(), Value::String(self.table.to_string()));
        self.params.write_into(&mut map);
        Value::Object(map)
    }
}

impl TryFrom<Value> for TableQuery {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self> {
        let mut map = match value {
            Value::Object(map) => map,
            other => return Err(invalid(format!("query must be an object, got {other}"))),
        };
        let table = match map.remove("table") {
            Some(Value::String(t)) => SmolStr::from(t),
            _ => return Err(invalid("query is missing `table`")),
        };
        Ok(TableQuery {
            table,
            params: QueryParams::from_map(map)?,
        })
    }
}

impl From<TableQuery> for Value {
    fn from(q: TableQuery) -> Self {
        q.to_json()
    }
}
