//! The SQL subset accepted by the observation store.
//!
//! Queries are parsed with the pest grammar in `sql.pest` into a small
//! [`Select`] tree, then rendered back to SQLite text with every literal
//! turned into a bound parameter. Anything outside the grammar (joins,
//! functions, DML, DDL, more than one statement) fails with
//! [`VantageError::QuerySyntax`].

use pest::Parser;
use pest::iterators::Pair;
use pest_derive::Parser;
use rusqlite::types::Value as SqlValue;

use crate::error::{Result, VantageError};

#[derive(Parser)]
#[grammar = "sql.pest"]
struct SqlParser;

#[derive(Debug, Clone, PartialEq)]
pub enum Projection {
    All,
    Columns(Vec<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Comparator {
    fn as_sql(&self) -> &'static str {
        match self {
            Comparator::Eq => "=",
            Comparator::Ne => "!=",
            Comparator::Lt => "<",
            Comparator::Le => "<=",
            Comparator::Gt => ">",
            Comparator::Ge => ">=",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Column(String),
    Integer(i64),
    Real(f64),
    Text(String),
    Null,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Or(Vec<Expr>),
    And(Vec<Expr>),
    Not(Box<Expr>),
    Compare(Operand, Comparator, Operand),
    IsNull { operand: Operand, negated: bool },
}

/// A parsed query.
#[derive(Debug, Clone, PartialEq)]
pub struct Select {
    pub projection: Projection,
    pub table: String,
    pub filter: Option<Expr>,
    pub order_by: Vec<(String, Direction)>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

pub fn parse(sql: &str) -> Result<Select> {
    let mut pairs =
        SqlParser::parse(Rule::query, sql).map_err(|e| VantageError::QuerySyntax(e.to_string()))?;
    let select = pairs
        .next()
        .and_then(|query| query.into_inner().find(|p| p.as_rule() == Rule::select))
        .ok_or_else(|| syntax("missing select statement"))?;
    build_select(select)
}

impl Select {
    /// SQLite text for this query and the parameters to bind, in order.
    pub fn to_sql(&self) -> (String, Vec<SqlValue>) {
        let mut params = Vec::new();
        let mut sql = String::from("SELECT ");
        match &self.projection {
            Projection::All => sql.push('*'),
            Projection::Columns(columns) => {
                let columns: Vec<_> = columns.iter().map(|c| quote(c)).collect();
                sql.push_str(&columns.join(", "));
            }
        }
        sql.push_str(" FROM ");
        sql.push_str(&quote(&self.table));
        if let Some(filter) = &self.filter {
            sql.push_str(" WHERE ");
            render_expr(filter, &mut sql, &mut params);
        }
        if !self.order_by.is_empty() {
            let orderings: Vec<_> = self
                .order_by
                .iter()
                .map(|(column, direction)| {
                    let direction = match direction {
                        Direction::Asc => "ASC",
                        Direction::Desc => "DESC",
                    };
                    format!("{} {}", quote(column), direction)
                })
                .collect();
            sql.push_str(" ORDER BY ");
            sql.push_str(&orderings.join(", "));
        }
        if let Some(limit) = self.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
            if let Some(offset) = self.offset {
                sql.push_str(&format!(" OFFSET {offset}"));
            }
        }
        (sql, params)
    }
}

// rowid aliases only resolve to the row id when left unquoted
fn quote(identifier: &str) -> String {
    if ["rowid", "oid", "_rowid_"].iter().any(|a| a.eq_ignore_ascii_case(identifier)) {
        identifier.to_owned()
    } else {
        format!("\"{}\"", identifier.replace('"', "\"\""))
    }
}

fn render_expr(expr: &Expr, sql: &mut String, params: &mut Vec<SqlValue>) {
    match expr {
        Expr::Or(terms) | Expr::And(terms) => {
            let joiner = if matches!(expr, Expr::Or(_)) { " OR " } else { " AND " };
            sql.push('(');
            for (i, term) in terms.iter().enumerate() {
                if i > 0 {
                    sql.push_str(joiner);
                }
                render_expr(term, sql, params);
            }
            sql.push(')');
        }
        Expr::Not(inner) => {
            sql.push_str("NOT ");
            render_expr(inner, sql, params);
        }
        Expr::Compare(lhs, comparator, rhs) => {
            render_operand(lhs, sql, params);
            sql.push(' ');
            sql.push_str(comparator.as_sql());
            sql.push(' ');
            render_operand(rhs, sql, params);
        }
        Expr::IsNull { operand, negated } => {
            render_operand(operand, sql, params);
            sql.push_str(if *negated { " IS NOT NULL" } else { " IS NULL" });
        }
    }
}

fn render_operand(operand: &Operand, sql: &mut String, params: &mut Vec<SqlValue>) {
    let value = match operand {
        Operand::Column(name) => return sql.push_str(&quote(name)),
        Operand::Null => return sql.push_str("NULL"),
        Operand::Integer(i) => SqlValue::Integer(*i),
        Operand::Real(r) => SqlValue::Real(*r),
        Operand::Text(t) => SqlValue::Text(t.clone()),
    };
    sql.push('?');
    params.push(value);
}

fn syntax(message: &str) -> VantageError {
    VantageError::QuerySyntax(message.to_owned())
}

fn child(pair: Pair<Rule>, rule: Rule) -> Result<Pair<Rule>> {
    pair.into_inner()
        .find(|p| p.as_rule() == rule)
        .ok_or_else(|| syntax(&format!("expected {rule:?}")))
}

fn build_select(pair: Pair<Rule>) -> Result<Select> {
    let mut select = Select {
        projection: Projection::All,
        table: String::new(),
        filter: None,
        order_by: Vec::new(),
        limit: None,
        offset: None,
    };
    for part in pair.into_inner() {
        match part.as_rule() {
            Rule::projection => select.projection = build_projection(part)?,
            Rule::table => select.table = identifier(child(part, Rule::identifier)?)?,
            Rule::where_clause => select.filter = Some(build_expr(child(part, Rule::expr)?)?),
            Rule::order_clause => {
                for ordering in part.into_inner().filter(|p| p.as_rule() == Rule::ordering) {
                    select.order_by.push(build_ordering(ordering)?);
                }
            }
            Rule::limit_clause => {
                let mut counts = part.into_inner().filter(|p| p.as_rule() == Rule::integer);
                select.limit = counts.next().map(|p| integer(p.as_str())).transpose()?;
                select.offset = counts.next().map(|p| integer(p.as_str())).transpose()?;
            }
            _ => (),
        }
    }
    Ok(select)
}

fn build_projection(pair: Pair<Rule>) -> Result<Projection> {
    let inner = pair.into_inner().next().ok_or_else(|| syntax("empty projection"))?;
    match inner.as_rule() {
        Rule::star => Ok(Projection::All),
        _ => inner
            .into_inner()
            .filter(|p| p.as_rule() == Rule::identifier)
            .map(identifier)
            .collect::<Result<Vec<_>>>()
            .map(Projection::Columns),
    }
}

fn build_ordering(pair: Pair<Rule>) -> Result<(String, Direction)> {
    let mut column = None;
    let mut direction = Direction::Asc;
    for part in pair.into_inner() {
        match part.as_rule() {
            Rule::identifier => column = Some(identifier(part)?),
            Rule::direction => {
                if part.into_inner().any(|p| p.as_rule() == Rule::kw_desc) {
                    direction = Direction::Desc;
                }
            }
            _ => (),
        }
    }
    Ok((column.ok_or_else(|| syntax("ordering without column"))?, direction))
}

fn build_expr(pair: Pair<Rule>) -> Result<Expr> {
    let mut terms = pair
        .into_inner()
        .filter(|p| p.as_rule() == Rule::conjunction)
        .map(build_conjunction)
        .collect::<Result<Vec<_>>>()?;
    Ok(if terms.len() == 1 { terms.remove(0) } else { Expr::Or(terms) })
}

fn build_conjunction(pair: Pair<Rule>) -> Result<Expr> {
    let mut terms = pair
        .into_inner()
        .filter(|p| p.as_rule() == Rule::negation)
        .map(build_negation)
        .collect::<Result<Vec<_>>>()?;
    Ok(if terms.len() == 1 { terms.remove(0) } else { Expr::And(terms) })
}

fn build_negation(pair: Pair<Rule>) -> Result<Expr> {
    let mut negated = false;
    let mut predicate = None;
    for part in pair.into_inner() {
        match part.as_rule() {
            Rule::kw_not => negated = true,
            Rule::predicate => predicate = Some(build_predicate(part)?),
            _ => (),
        }
    }
    let predicate = predicate.ok_or_else(|| syntax("missing predicate"))?;
    Ok(if negated { Expr::Not(Box::new(predicate)) } else { predicate })
}

fn build_predicate(pair: Pair<Rule>) -> Result<Expr> {
    let inner = pair.into_inner().next().ok_or_else(|| syntax("empty predicate"))?;
    match inner.as_rule() {
        Rule::expr => build_expr(inner),
        Rule::null_test => {
            let mut operand = None;
            let mut negated = false;
            for part in inner.into_inner() {
                match part.as_rule() {
                    Rule::operand => operand = Some(build_operand(part)?),
                    Rule::kw_not => negated = true,
                    _ => (),
                }
            }
            let operand = operand.ok_or_else(|| syntax("null test without operand"))?;
            Ok(Expr::IsNull { operand, negated })
        }
        Rule::comparison => {
            let mut operands = Vec::with_capacity(2);
            let mut comparator = None;
            for part in inner.into_inner() {
                match part.as_rule() {
                    Rule::operand => operands.push(build_operand(part)?),
                    Rule::comparator => comparator = Some(build_comparator(part.as_str())?),
                    _ => (),
                }
            }
            let comparator = comparator.ok_or_else(|| syntax("missing comparator"))?;
            let rhs = operands.pop().ok_or_else(|| syntax("missing right operand"))?;
            let lhs = operands.pop().ok_or_else(|| syntax("missing left operand"))?;
            Ok(Expr::Compare(lhs, comparator, rhs))
        }
        other => Err(syntax(&format!("unexpected {other:?}"))),
    }
}

fn build_comparator(text: &str) -> Result<Comparator> {
    Ok(match text {
        "=" | "==" => Comparator::Eq,
        "!=" | "<>" => Comparator::Ne,
        "<" => Comparator::Lt,
        "<=" => Comparator::Le,
        ">" => Comparator::Gt,
        ">=" => Comparator::Ge,
        other => return Err(syntax(&format!("unknown comparator {other}"))),
    })
}

fn build_operand(pair: Pair<Rule>) -> Result<Operand> {
    let inner = pair.into_inner().next().ok_or_else(|| syntax("empty operand"))?;
    match inner.as_rule() {
        Rule::null_literal => Ok(Operand::Null),
        Rule::number => number(inner.as_str()),
        Rule::string => Ok(Operand::Text(
            inner
                .into_inner()
                .next()
                .map(|p| p.as_str().replace("''", "'"))
                .unwrap_or_default(),
        )),
        Rule::identifier => identifier(inner).map(Operand::Column),
        other => Err(syntax(&format!("unexpected {other:?}"))),
    }
}

fn identifier(pair: Pair<Rule>) -> Result<String> {
    let inner = pair.into_inner().next().ok_or_else(|| syntax("empty identifier"))?;
    Ok(match inner.as_rule() {
        Rule::quoted_identifier => inner
            .into_inner()
            .next()
            .map(|p| p.as_str().replace("\"\"", "\""))
            .unwrap_or_default(),
        _ => inner.as_str().to_owned(),
    })
}

fn number(text: &str) -> Result<Operand> {
    if !text.contains(['.', 'e', 'E']) {
        if let Ok(i) = text.parse::<i64>() {
            return Ok(Operand::Integer(i));
        }
    }
    text.parse::<f64>()
        .map(Operand::Real)
        .map_err(|e| syntax(&format!("bad number {text}: {e}")))
}

fn integer(text: &str) -> Result<i64> {
    text.parse::<i64>().map_err(|e| syntax(&format!("bad count {text}: {e}")))
}
