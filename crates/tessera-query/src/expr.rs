//! Expressions and boolean conditions
//!
//! Both are closed tagged unions evaluated against a row and the command
//! context. The index planner and the MATCH scheduler inspect them
//! structurally, so every kind is matched exhaustively.

use crate::context::CommandContext;
use crate::result::Row;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use tessera_core::{Direction, Error, Result, Value};
use tessera_storage::full_text_words;

/// Arithmetic operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArithmeticOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// Comparison operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    /// The operator with both sides swapped
    pub fn flip(self) -> Self {
        match self {
            CompareOp::Lt => CompareOp::Gt,
            CompareOp::Le => CompareOp::Ge,
            CompareOp::Gt => CompareOp::Lt,
            CompareOp::Ge => CompareOp::Le,
            op => op,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "<>",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        }
    }

    fn test(self, left: &Value, right: &Value) -> bool {
        use std::cmp::Ordering::*;
        match self {
            CompareOp::Eq => left.loose_eq(right),
            CompareOp::Ne => !left.is_null() && !right.is_null() && !left.loose_eq(right),
            CompareOp::Lt => left.compare(right) == Some(Less),
            CompareOp::Le => matches!(left.compare(right), Some(Less | Equal)),
            CompareOp::Gt => left.compare(right) == Some(Greater),
            CompareOp::Ge => matches!(left.compare(right), Some(Greater | Equal)),
        }
    }
}

/// A value-producing expression
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expression {
    Literal(Value),
    /// Field or `@rid`/`@class`/`@version` attribute of the current row
    Field(String),
    /// Dotted path that dereferences links: `friend.address.city`
    Path(Vec<String>),
    /// Named input parameter
    Parameter(String),
    /// Context variable such as `$depth`, `$current` or a LET variable
    Variable(String),
    /// Binding of a MATCH alias: `$matched.alias` or `$matched.alias.field`
    Matched { alias: String, field: Option<String> },
    List(Vec<Expression>),
    Arithmetic {
        op: ArithmeticOp,
        left: Box<Expression>,
        right: Box<Expression>,
    },
    Size(Box<Expression>),
    /// Adjacent vertices of the current element
    Neighbors {
        direction: Direction,
        classes: Vec<String>,
    },
}

impl Expression {
    pub fn lit<V: Into<Value>>(value: V) -> Self {
        Expression::Literal(value.into())
    }

    pub fn field<S: Into<String>>(name: S) -> Self {
        Expression::Field(name.into())
    }

    pub fn path(segments: &[&str]) -> Self {
        Expression::Path(segments.iter().map(|s| s.to_string()).collect())
    }

    pub fn param<S: Into<String>>(name: S) -> Self {
        Expression::Parameter(name.into())
    }

    pub fn var<S: Into<String>>(name: S) -> Self {
        Expression::Variable(name.into())
    }

    pub fn matched<S: Into<String>>(alias: S, field: Option<&str>) -> Self {
        Expression::Matched {
            alias: alias.into(),
            field: field.map(str::to_string),
        }
    }

    pub fn arithmetic(op: ArithmeticOp, left: Expression, right: Expression) -> Self {
        Expression::Arithmetic {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    /// True when the value does not depend on the current row
    pub fn is_row_independent(&self) -> bool {
        match self {
            Expression::Literal(_) | Expression::Parameter(_) => true,
            Expression::Variable(name) => name != "current" && name != "depth",
            Expression::List(items) => items.iter().all(Expression::is_row_independent),
            Expression::Arithmetic { left, right, .. } => {
                left.is_row_independent() && right.is_row_independent()
            }
            Expression::Size(inner) => inner.is_row_independent(),
            Expression::Field(_)
            | Expression::Path(_)
            | Expression::Matched { .. }
            | Expression::Neighbors { .. } => false,
        }
    }

    /// The field name when the expression is a plain field reference
    pub fn as_field(&self) -> Option<&str> {
        match self {
            Expression::Field(name) => Some(name),
            _ => None,
        }
    }

    pub fn collect_aliases(&self, aliases: &mut BTreeSet<String>) {
        match self {
            Expression::Matched { alias, .. } => {
                aliases.insert(alias.clone());
            }
            Expression::List(items) => items.iter().for_each(|e| e.collect_aliases(aliases)),
            Expression::Arithmetic { left, right, .. } => {
                left.collect_aliases(aliases);
                right.collect_aliases(aliases);
            }
            Expression::Size(inner) => inner.collect_aliases(aliases),
            _ => {}
        }
    }

    pub fn evaluate(&self, row: &Row, ctx: &mut CommandContext<'_>) -> Result<Value> {
        match self {
            Expression::Literal(value) => Ok(value.clone()),
            Expression::Field(name) => Ok(row.property(name)),
            Expression::Path(segments) => {
                let Some((first, rest)) = segments.split_first() else {
                    return Ok(Value::Null);
                };
                let mut value = row.property(first);
                for segment in rest {
                    value = dereference(value, segment, ctx)?;
                }
                Ok(value)
            }
            Expression::Parameter(name) => ctx.param(name).cloned().ok_or_else(|| {
                Error::CommandExecution(format!("Parameter :{} was not provided", name))
            }),
            Expression::Variable(name) => Ok(match name.as_str() {
                "current" => ctx.current().map(Row::to_value).unwrap_or_default(),
                _ => ctx.variable(name).unwrap_or_default(),
            }),
            Expression::Matched { alias, field } => {
                let bound = ctx
                    .matched()
                    .map(|m| m.property(alias))
                    .unwrap_or_default();
                match field {
                    Some(field) => dereference(bound, field, ctx),
                    None => Ok(bound),
                }
            }
            Expression::List(items) => items
                .iter()
                .map(|item| item.evaluate(row, ctx))
                .collect::<Result<Vec<_>>>()
                .map(Value::List),
            Expression::Arithmetic { op, left, right } => {
                let left = left.evaluate(row, ctx)?;
                let right = right.evaluate(row, ctx)?;
                arithmetic(*op, &left, &right)
            }
            Expression::Size(inner) => Ok(Value::Integer(match inner.evaluate(row, ctx)? {
                Value::Null => 0,
                Value::List(items) => items.len() as i64,
                Value::Map(map) => map.len() as i64,
                Value::String(s) => s.chars().count() as i64,
                _ => 1,
            })),
            Expression::Neighbors { direction, classes } => {
                let Some(rid) = row.rid() else {
                    return Ok(Value::List(Vec::new()));
                };
                let classes: Vec<&str> = classes.iter().map(String::as_str).collect();
                let neighbors = ctx.session().neighbors(rid, *direction, &classes)?;
                Ok(Value::List(neighbors.into_iter().map(Value::Link).collect()))
            }
        }
    }
}

/// Follow one path segment; stale links resolve to null
fn dereference(value: Value, segment: &str, ctx: &mut CommandContext<'_>) -> Result<Value> {
    match value {
        Value::Link(rid) => Ok(ctx
            .session()
            .try_load(rid)?
            .map(|record| record.attribute(segment))
            .unwrap_or_default()),
        Value::Map(map) => Ok(map.get(segment).cloned().unwrap_or_default()),
        Value::List(items) => items
            .into_iter()
            .map(|item| dereference(item, segment, ctx))
            .collect::<Result<Vec<_>>>()
            .map(Value::List),
        _ => Ok(Value::Null),
    }
}

fn arithmetic(op: ArithmeticOp, left: &Value, right: &Value) -> Result<Value> {
    if left.is_null() || right.is_null() {
        return Ok(Value::Null);
    }
    if op == ArithmeticOp::Add {
        if let (Some(l), Some(r)) = (left.as_str(), right.as_str()) {
            return Ok(Value::String(format!("{}{}", l, r)));
        }
    }
    match (left, right) {
        (Value::Integer(l), Value::Integer(r)) => match op {
            ArithmeticOp::Add => Ok(Value::Integer(l.wrapping_add(*r))),
            ArithmeticOp::Sub => Ok(Value::Integer(l.wrapping_sub(*r))),
            ArithmeticOp::Mul => Ok(Value::Integer(l.wrapping_mul(*r))),
            ArithmeticOp::Div if *r == 0 => {
                Err(Error::CommandExecution("Division by zero".to_string()))
            }
            ArithmeticOp::Div => Ok(Value::Integer(l / r)),
        },
        (l, r) if l.is_numeric() && r.is_numeric() => {
            let (l, r) = (l.as_float().unwrap_or(0.0), r.as_float().unwrap_or(0.0));
            Ok(Value::Float(match op {
                ArithmeticOp::Add => l + r,
                ArithmeticOp::Sub => l - r,
                ArithmeticOp::Mul => l * r,
                ArithmeticOp::Div => l / r,
            }))
        }
        (l, r) => Err(Error::TypeMismatch {
            expected: "number".to_string(),
            found: format!("{} and {}", l.type_name(), r.type_name()),
        }),
    }
}

/// Boolean condition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Condition {
    True,
    Compare {
        left: Expression,
        op: CompareOp,
        right: Expression,
    },
    /// Inclusive range
    Between {
        expr: Expression,
        low: Expression,
        high: Expression,
    },
    In {
        expr: Expression,
        values: Expression,
    },
    IsNull(Expression),
    IsNotNull(Expression),
    /// The current element belongs to the class or a subclass
    InstanceOf(String),
    /// Every word of `text` occurs in the field
    ContainsText {
        expr: Expression,
        text: Expression,
    },
    And(Vec<Condition>),
    Or(Vec<Condition>),
    Not(Box<Condition>),
}

impl Condition {
    pub fn compare<V: Into<Value>>(field: &str, op: CompareOp, value: V) -> Self {
        Condition::Compare {
            left: Expression::field(field),
            op,
            right: Expression::lit(value),
        }
    }

    pub fn eq<V: Into<Value>>(field: &str, value: V) -> Self {
        Self::compare(field, CompareOp::Eq, value)
    }

    pub fn between<L: Into<Value>, H: Into<Value>>(field: &str, low: L, high: H) -> Self {
        Condition::Between {
            expr: Expression::field(field),
            low: Expression::lit(low),
            high: Expression::lit(high),
        }
    }

    pub fn in_values<V: Into<Value>>(field: &str, values: Vec<V>) -> Self {
        Condition::In {
            expr: Expression::field(field),
            values: Expression::List(values.into_iter().map(Expression::lit).collect()),
        }
    }

    pub fn contains_text(field: &str, text: &str) -> Self {
        Condition::ContainsText {
            expr: Expression::field(field),
            text: Expression::lit(text),
        }
    }

    pub fn not(condition: Condition) -> Self {
        Condition::Not(Box::new(condition))
    }

    pub fn is_true(&self) -> bool {
        matches!(self, Condition::True)
    }

    /// Conjunction of two conditions, flattening nested ANDs
    pub fn and(self, other: Condition) -> Condition {
        match (self, other) {
            (Condition::True, c) | (c, Condition::True) => c,
            (Condition::And(mut a), Condition::And(b)) => {
                a.extend(b);
                Condition::And(a)
            }
            (Condition::And(mut a), c) => {
                a.push(c);
                Condition::And(a)
            }
            (c, Condition::And(mut b)) => {
                b.insert(0, c);
                Condition::And(b)
            }
            (a, b) => Condition::And(vec![a, b]),
        }
    }

    /// Top-level conjuncts
    pub fn conjuncts(&self) -> Vec<&Condition> {
        match self {
            Condition::And(items) => items.iter().flat_map(Condition::conjuncts).collect(),
            Condition::True => Vec::new(),
            c => vec![c],
        }
    }

    /// MATCH aliases referenced through `$matched`
    pub fn referenced_aliases(&self) -> BTreeSet<String> {
        let mut aliases = BTreeSet::new();
        self.collect_aliases(&mut aliases);
        aliases
    }

    fn collect_aliases(&self, aliases: &mut BTreeSet<String>) {
        match self {
            Condition::True | Condition::InstanceOf(_) => {}
            Condition::Compare { left, right, .. } => {
                left.collect_aliases(aliases);
                right.collect_aliases(aliases);
            }
            Condition::Between { expr, low, high } => {
                expr.collect_aliases(aliases);
                low.collect_aliases(aliases);
                high.collect_aliases(aliases);
            }
            Condition::In { expr, values } => {
                expr.collect_aliases(aliases);
                values.collect_aliases(aliases);
            }
            Condition::ContainsText { expr, text } => {
                expr.collect_aliases(aliases);
                text.collect_aliases(aliases);
            }
            Condition::IsNull(expr) | Condition::IsNotNull(expr) => expr.collect_aliases(aliases),
            Condition::And(items) | Condition::Or(items) => {
                items.iter().for_each(|c| c.collect_aliases(aliases))
            }
            Condition::Not(inner) => inner.collect_aliases(aliases),
        }
    }

    pub fn evaluate(&self, row: &Row, ctx: &mut CommandContext<'_>) -> Result<bool> {
        match self {
            Condition::True => Ok(true),
            Condition::Compare { left, op, right } => {
                let left = left.evaluate(row, ctx)?;
                let right = right.evaluate(row, ctx)?;
                Ok(op.test(&left, &right))
            }
            Condition::Between { expr, low, high } => {
                let value = expr.evaluate(row, ctx)?;
                let low = low.evaluate(row, ctx)?;
                let high = high.evaluate(row, ctx)?;
                Ok(CompareOp::Ge.test(&value, &low) && CompareOp::Le.test(&value, &high))
            }
            Condition::In { expr, values } => {
                let value = expr.evaluate(row, ctx)?;
                Ok(match values.evaluate(row, ctx)? {
                    Value::List(items) => items.iter().any(|item| value.loose_eq(item)),
                    single => value.loose_eq(&single),
                })
            }
            Condition::IsNull(expr) => Ok(expr.evaluate(row, ctx)?.is_null()),
            Condition::IsNotNull(expr) => Ok(!expr.evaluate(row, ctx)?.is_null()),
            Condition::InstanceOf(class) => match row.as_element() {
                Some(record) => {
                    let schema = ctx.session().database().schema()?;
                    Ok(schema.is_subclass_of(&record.class, class))
                }
                None => Ok(false),
            },
            Condition::ContainsText { expr, text } => {
                let value = expr.evaluate(row, ctx)?;
                let text = text.evaluate(row, ctx)?;
                match (value.as_str(), text.as_str()) {
                    (Some(value), Some(text)) => {
                        let words = full_text_words(value);
                        Ok(full_text_words(text).iter().all(|w| words.contains(w)))
                    }
                    _ => Ok(false),
                }
            }
            Condition::And(items) => {
                for item in items {
                    if !item.evaluate(row, ctx)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Condition::Or(items) => {
                for item in items {
                    if item.evaluate(row, ctx)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Condition::Not(inner) => Ok(!inner.evaluate(row, ctx)?),
        }
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expression::Literal(value) => write!(f, "{}", value),
            Expression::Field(name) => write!(f, "{}", name),
            Expression::Path(segments) => write!(f, "{}", segments.join(".")),
            Expression::Parameter(name) => write!(f, ":{}", name),
            Expression::Variable(name) => write!(f, "${}", name),
            Expression::Matched { alias, field } => match field {
                Some(field) => write!(f, "$matched.{}.{}", alias, field),
                None => write!(f, "$matched.{}", alias),
            },
            Expression::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Expression::Arithmetic { op, left, right } => {
                let symbol = match op {
                    ArithmeticOp::Add => "+",
                    ArithmeticOp::Sub => "-",
                    ArithmeticOp::Mul => "*",
                    ArithmeticOp::Div => "/",
                };
                write!(f, "({} {} {})", left, symbol, right)
            }
            Expression::Size(inner) => write!(f, "{}.size()", inner),
            Expression::Neighbors { direction, classes } => {
                let name = match direction {
                    Direction::Outgoing => "out",
                    Direction::Incoming => "in",
                    Direction::Both => "both",
                };
                let classes: Vec<String> = classes.iter().map(|c| format!("'{}'", c)).collect();
                write!(f, "{}({})", name, classes.join(", "))
            }
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::True => write!(f, "true"),
            Condition::Compare { left, op, right } => {
                write!(f, "{} {} {}", left, op.symbol(), right)
            }
            Condition::Between { expr, low, high } => {
                write!(f, "{} BETWEEN {} AND {}", expr, low, high)
            }
            Condition::In { expr, values } => write!(f, "{} IN {}", expr, values),
            Condition::IsNull(expr) => write!(f, "{} IS NULL", expr),
            Condition::IsNotNull(expr) => write!(f, "{} IS NOT NULL", expr),
            Condition::InstanceOf(class) => write!(f, "@this INSTANCEOF '{}'", class),
            Condition::ContainsText { expr, text } => write!(f, "{} CONTAINSTEXT {}", expr, text),
            Condition::And(items) | Condition::Or(items) => {
                let joiner = if matches!(self, Condition::And(_)) {
                    " AND "
                } else {
                    " OR "
                };
                let parts: Vec<String> = items.iter().map(|c| c.to_string()).collect();
                write!(f, "({})", parts.join(joiner))
            }
            Condition::Not(inner) => write!(f, "NOT ({})", inner),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestDb;
    use tessera_core::Fields;

    fn row() -> Row {
        let mut row = Row::with("name", "n1");
        row.set_property("age", 30);
        row.set_property("tags", Value::from(vec!["a", "b"]));
        row
    }

    #[test]
    fn test_comparisons() {
        let db = TestDb::new();
        let mut session = db.session();
        let mut ctx = db.context(&mut session);
        let row = row();

        assert!(Condition::eq("name", "n1").evaluate(&row, &mut ctx).unwrap());
        assert!(!Condition::eq("name", "n2").evaluate(&row, &mut ctx).unwrap());
        assert!(Condition::compare("age", CompareOp::Ge, 30).evaluate(&row, &mut ctx).unwrap());
        assert!(Condition::compare("age", CompareOp::Lt, 30.5).evaluate(&row, &mut ctx).unwrap());
        assert!(!Condition::compare("missing", CompareOp::Ne, 1).evaluate(&row, &mut ctx).unwrap());
        assert!(Condition::between("age", 30, 40).evaluate(&row, &mut ctx).unwrap());
        assert!(Condition::in_values("age", vec![1, 30]).evaluate(&row, &mut ctx).unwrap());
        assert!(Condition::IsNull(Expression::field("missing")).evaluate(&row, &mut ctx).unwrap());
    }

    #[test]
    fn test_boolean_connectives() {
        let db = TestDb::new();
        let mut session = db.session();
        let mut ctx = db.context(&mut session);
        let row = row();

        let both = Condition::eq("name", "n1").and(Condition::eq("age", 30));
        assert!(both.evaluate(&row, &mut ctx).unwrap());
        let either = Condition::Or(vec![Condition::eq("name", "x"), Condition::eq("age", 30)]);
        assert!(either.evaluate(&row, &mut ctx).unwrap());
        assert!(!Condition::not(either).evaluate(&row, &mut ctx).unwrap());
        assert_eq!(both.conjuncts().len(), 2);
    }

    #[test]
    fn test_arithmetic_and_size() {
        let db = TestDb::new();
        let mut session = db.session();
        let mut ctx = db.context(&mut session);
        let row = row();

        let sum = Expression::arithmetic(ArithmeticOp::Add, Expression::field("age"), Expression::lit(2));
        assert_eq!(sum.evaluate(&row, &mut ctx).unwrap(), Value::Integer(32));
        let half = Expression::arithmetic(ArithmeticOp::Div, Expression::field("age"), Expression::lit(4.0));
        assert_eq!(half.evaluate(&row, &mut ctx).unwrap(), Value::Float(7.5));
        let zero = Expression::arithmetic(ArithmeticOp::Div, Expression::lit(1), Expression::lit(0));
        assert!(zero.evaluate(&row, &mut ctx).is_err());
        let size = Expression::Size(Box::new(Expression::field("tags")));
        assert_eq!(size.evaluate(&row, &mut ctx).unwrap(), Value::Integer(2));
    }

    #[test]
    fn test_parameters_and_variables() {
        let db = TestDb::new();
        let mut session = db.session();
        let mut ctx = db.context(&mut session);
        ctx.set_param("name", "n1");
        ctx.set_variable("depth", 3);

        let cond = Condition::Compare {
            left: Expression::field("name"),
            op: CompareOp::Eq,
            right: Expression::param("name"),
        };
        assert!(cond.evaluate(&row(), &mut ctx).unwrap());
        assert_eq!(Expression::var("depth").evaluate(&row(), &mut ctx).unwrap(), Value::Integer(3));
        assert!(Expression::param("missing").evaluate(&row(), &mut ctx).is_err());
    }

    #[test]
    fn test_path_dereferences_links() {
        let db = TestDb::with_schema();
        let people = db.people(2);
        let mut session = db.session();
        let mut doc = session.new_record("Doc").unwrap();
        doc.set("owner", people[1]);
        doc.set("stale", tessera_core::Rid::new(99, 9));
        let doc = session.save(doc).unwrap();
        let mut ctx = db.context(&mut session);
        let row = Row::element(doc);

        let owner_name = Expression::path(&["owner", "name"]);
        assert_eq!(owner_name.evaluate(&row, &mut ctx).unwrap(), Value::from("n1"));
        let stale = Expression::path(&["stale", "name"]);
        assert_eq!(stale.evaluate(&row, &mut ctx).unwrap(), Value::Null);
    }

    #[test]
    fn test_instance_of_and_contains_text() {
        let db = TestDb::with_schema();
        let mut session = db.session();
        let person = session
            .create_vertex("Person", Fields::with("bio", "Likes Rust and graphs"))
            .unwrap();
        let mut ctx = db.context(&mut session);
        let row = Row::element(person);

        assert!(Condition::InstanceOf("V".into()).evaluate(&row, &mut ctx).unwrap());
        assert!(!Condition::InstanceOf("E".into()).evaluate(&row, &mut ctx).unwrap());
        assert!(Condition::contains_text("bio", "rust GRAPHS").evaluate(&row, &mut ctx).unwrap());
        assert!(!Condition::contains_text("bio", "python").evaluate(&row, &mut ctx).unwrap());
    }

    #[test]
    fn test_referenced_aliases() {
        let cond = Condition::Compare {
            left: Expression::field("age"),
            op: CompareOp::Gt,
            right: Expression::matched("a", Some("age")),
        }
        .and(Condition::IsNotNull(Expression::matched("b", None)));
        let aliases: Vec<String> = cond.referenced_aliases().into_iter().collect();
        assert_eq!(aliases, vec!["a", "b"]);
    }

    #[test]
    fn test_display() {
        let cond = Condition::eq("name", "n1").and(Condition::between("age", 1, 5));
        assert_eq!(cond.to_string(), "(name = 'n1' AND age BETWEEN 1 AND 5)");
    }
}
