use std::collections::{BTreeSet, HashMap};

use sqlparser::ast::{
    self, Assignment, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertUser(NewUser),
    UpdateProfile {
        id: Ulid,
        patch: ProfilePatch,
    },
    UpdateRoles {
        id: Ulid,
        roles: BTreeSet<Role>,
    },
    SelectProfile,
    InsertSpace(Space),
    UpdateSpace {
        id: Ulid,
        patch: SpacePatch,
    },
    DeleteSpace {
        id: Ulid,
    },
    SelectSpaces {
        id: Option<Ulid>,
    },
    SelectAvailability {
        space_id: Ulid,
        start: Ms,
        end: Ms,
        exclude_id: Option<Ulid>,
    },
    SelectFreeSlots {
        space_id: Ulid,
        start: Ms,
        end: Ms,
    },
    InsertReservation(NewReservation),
    UpdateReservation {
        id: Ulid,
        patch: ReservationPatch,
    },
    DeleteReservation {
        id: Ulid,
    },
    SelectReservations {
        id: Option<Ulid>,
    },
    SelectUpcoming,
    SelectCalendar {
        start: Ms,
        end: Ms,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let stmt = match stmts.as_slice() {
        [] => return Err(SqlError::Empty),
        [one] => one,
        _ => return Err(SqlError::Unsupported("multiple statements".into())),
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table.relation, assignments, selection),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

// ── INSERT ────────────────────────────────────────────────────

/// Column → value for a single-row INSERT with an explicit column list.
struct Row {
    table: &'static str,
    values: HashMap<String, Expr>,
}

impl Row {
    fn from_insert(table: &'static str, insert: &ast::Insert, allowed: &[&str]) -> Result<Self, SqlError> {
        if insert.columns.is_empty() {
            return Err(SqlError::Parse(format!("{table}: column list is required")));
        }
        let rows = extract_insert_rows(insert)?;
        let [values] = rows.as_slice() else {
            return Err(SqlError::Unsupported(format!("{table}: multi-row INSERT")));
        };
        if values.len() != insert.columns.len() {
            return Err(SqlError::WrongArity(table, insert.columns.len(), values.len()));
        }
        let mut map = HashMap::new();
        for (col, value) in insert.columns.iter().zip(values) {
            let name = col.value.to_lowercase();
            if !allowed.contains(&name.as_str()) {
                return Err(SqlError::UnknownColumn(table, name));
            }
            map.insert(name, value.clone());
        }
        Ok(Self { table, values: map })
    }

    fn get(&self, col: &str) -> Option<&Expr> {
        self.values.get(col)
    }

    fn required(&self, col: &'static str) -> Result<&Expr, SqlError> {
        self.get(col).ok_or(SqlError::MissingColumn(self.table, col))
    }
}

const USER_COLUMNS: &[&str] = &["id", "email", "first_name", "last_name", "password"];
const SPACE_COLUMNS: &[&str] = &[
    "id",
    "name",
    "description",
    "price",
    "capacity",
    "location",
    "amenities",
    "image_url",
    "is_active",
];
const RESERVATION_COLUMNS: &[&str] = &["id", "space_id", "start", "end", "attendees", "notes"];

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;

    match table.as_str() {
        "users" => {
            let row = Row::from_insert("users", insert, USER_COLUMNS)?;
            Ok(Command::InsertUser(NewUser {
                id: parse_ulid_expr(row.required("id")?)?,
                email: parse_text(row.required("email")?)?,
                first_name: parse_text(row.required("first_name")?)?,
                last_name: parse_text(row.required("last_name")?)?,
                password: parse_text(row.required("password")?)?,
            }))
        }
        "spaces" => {
            let row = Row::from_insert("spaces", insert, SPACE_COLUMNS)?;
            let optional_text = |col: &str| row.get(col).map(parse_text_or_null).transpose().map(Option::flatten);
            Ok(Command::InsertSpace(Space {
                id: parse_ulid_expr(row.required("id")?)?,
                name: parse_text(row.required("name")?)?,
                description: optional_text("description")?.unwrap_or_default(),
                price: parse_money(row.required("price")?)?,
                capacity: parse_u32(row.required("capacity")?)?,
                location: optional_text("location")?,
                amenities: row.get("amenities").map(parse_amenities).transpose()?.unwrap_or_default(),
                image_url: optional_text("image_url")?,
                is_active: row.get("is_active").map(parse_bool).transpose()?.unwrap_or(true),
            }))
        }
        "reservations" => {
            let row = Row::from_insert("reservations", insert, RESERVATION_COLUMNS)?;
            Ok(Command::InsertReservation(NewReservation {
                id: parse_ulid_expr(row.required("id")?)?,
                space_id: parse_ulid_expr(row.required("space_id")?)?,
                // Ordering is validated by the engine, not here.
                span: Span {
                    start: parse_i64_expr(row.required("start")?)?,
                    end: parse_i64_expr(row.required("end")?)?,
                },
                attendees: parse_u32(row.required("attendees")?)?,
                notes: row.get("notes").map(parse_text_or_null).transpose()?.flatten(),
            }))
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── UPDATE ────────────────────────────────────────────────────

fn assignment_column(a: &Assignment) -> Result<String, SqlError> {
    match &a.target {
        AssignmentTarget::ColumnName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty column name".into()))
        }
        AssignmentTarget::Tuple(_) => Err(SqlError::Unsupported("tuple assignment".into())),
    }
}

fn parse_update(
    relation: &TableFactor,
    assignments: &[Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    let id = extract_where_id(selection)?;
    if assignments.is_empty() {
        return Err(SqlError::Parse("UPDATE without SET".into()));
    }

    match table.as_str() {
        "users" => parse_user_update(id, assignments),
        "spaces" => {
            let mut patch = SpacePatch::default();
            for a in assignments {
                let col = assignment_column(a)?;
                let v = &a.value;
                match col.as_str() {
                    "name" => patch.name = Some(parse_text(v)?),
                    "description" => patch.description = Some(parse_text(v)?),
                    "price" => patch.price = Some(parse_money(v)?),
                    "capacity" => patch.capacity = Some(parse_u32(v)?),
                    "location" => patch.location = Some(parse_text(v)?),
                    "amenities" => patch.amenities = Some(parse_amenities(v)?),
                    "image_url" => patch.image_url = Some(parse_text(v)?),
                    "is_active" => patch.is_active = Some(parse_bool(v)?),
                    _ => return Err(SqlError::UnknownColumn("spaces", col)),
                }
            }
            Ok(Command::UpdateSpace { id, patch })
        }
        "reservations" => {
            let mut patch = ReservationPatch::default();
            for a in assignments {
                let col = assignment_column(a)?;
                match col.as_str() {
                    "status" => patch.status = Some(parse_text(&a.value)?),
                    "notes" => patch.notes = Some(parse_text(&a.value)?),
                    "start" | "end" | "space_id" => {
                        return Err(SqlError::Unsupported(format!(
                            "reservations.{col} cannot be changed; cancel and book again"
                        )));
                    }
                    _ => return Err(SqlError::UnknownColumn("reservations", col)),
                }
            }
            Ok(Command::UpdateReservation { id, patch })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_user_update(id: Ulid, assignments: &[Assignment]) -> Result<Command, SqlError> {
    let mut patch = ProfilePatch::default();
    let mut roles = None;
    for a in assignments {
        let col = assignment_column(a)?;
        let v = &a.value;
        match col.as_str() {
            "first_name" => patch.first_name = Some(parse_text(v)?),
            "last_name" => patch.last_name = Some(parse_text(v)?),
            "password" => patch.new_password = Some(parse_text(v)?),
            "current_password" => patch.current_password = Some(parse_text(v)?),
            "roles" => roles = Some(parse_roles(v)?),
            _ => return Err(SqlError::UnknownColumn("users", col)),
        }
    }
    match roles {
        Some(roles) if patch == ProfilePatch::default() => Ok(Command::UpdateRoles { id, roles }),
        Some(_) => Err(SqlError::Unsupported("users.roles cannot be combined with other columns".into())),
        None => Ok(Command::UpdateProfile { id, patch }),
    }
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "spaces" => Ok(Command::DeleteSpace { id }),
        "reservations" => Ok(Command::DeleteReservation { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── SELECT ────────────────────────────────────────────────────

/// Filters collected from a WHERE clause of `AND`-joined comparisons.
#[derive(Default)]
struct Filters {
    id: Option<Ulid>,
    space_id: Option<Ulid>,
    exclude_id: Option<Ulid>,
    start: Option<Ms>,
    end: Option<Ms>,
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    let mut f = Filters::default();
    if let Some(selection) = &select.selection {
        extract_filters(selection, &mut f)?;
    }

    match table.as_str() {
        "profile" => Ok(Command::SelectProfile),
        "spaces" => Ok(Command::SelectSpaces { id: f.id }),
        "reservations" => Ok(Command::SelectReservations { id: f.id }),
        "upcoming_reservations" => Ok(Command::SelectUpcoming),
        "availability" => Ok(Command::SelectAvailability {
            space_id: f.space_id.ok_or(SqlError::MissingFilter("space_id"))?,
            start: f.start.ok_or(SqlError::MissingFilter("start"))?,
            end: f.end.ok_or(SqlError::MissingFilter("end"))?,
            exclude_id: f.exclude_id,
        }),
        "free_slots" => Ok(Command::SelectFreeSlots {
            space_id: f.space_id.ok_or(SqlError::MissingFilter("space_id"))?,
            start: f.start.ok_or(SqlError::MissingFilter("start"))?,
            end: f.end.ok_or(SqlError::MissingFilter("end"))?,
        }),
        "calendar" => Ok(Command::SelectCalendar {
            start: f.start.ok_or(SqlError::MissingFilter("start"))?,
            end: f.end.ok_or(SqlError::MissingFilter("end"))?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn extract_filters(expr: &Expr, f: &mut Filters) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => extract_filters(inner, f),
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                extract_filters(left, f)?;
                extract_filters(right, f)
            }
            ast::BinaryOperator::Eq => {
                let col = expr_column_name(left).ok_or_else(|| SqlError::Parse("expected column".into()))?;
                match col.as_str() {
                    "id" => f.id = Some(parse_ulid_expr(right)?),
                    "space_id" => f.space_id = Some(parse_ulid_expr(right)?),
                    "exclude_id" => f.exclude_id = parse_ulid_or_null(right)?,
                    _ => return Err(SqlError::UnsupportedFilter(col)),
                }
                Ok(())
            }
            ast::BinaryOperator::GtEq if expr_column_name(left).as_deref() == Some("start") => {
                f.start = Some(parse_i64_expr(right)?);
                Ok(())
            }
            ast::BinaryOperator::LtEq if expr_column_name(left).as_deref() == Some("end") => {
                f.end = Some(parse_i64_expr(right)?);
                Ok(())
            }
            _ => Err(SqlError::UnsupportedFilter(expr.to_string())),
        },
        _ => Err(SqlError::UnsupportedFilter(expr.to_string())),
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    match tables_with_joins.first() {
        Some(first) => table_factor_name(&first.relation),
        None => Err(SqlError::Parse("DELETE without table".into())),
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_insert_rows(insert: &ast::Insert) -> Result<Vec<Vec<Expr>>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(values.rows.clone())
        }
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some("id") => parse_ulid_expr(right),
        _ => Err(SqlError::MissingFilter("id")),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected ULID string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_ulid_expr(expr).map(Some),
    }
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .trim()
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64_expr(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of range")))
}

fn parse_text(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(Value::Number(s, _)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected text, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_text_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_text(expr).map(Some),
    }
}

fn parse_money(expr: &Expr) -> Result<Money, SqlError> {
    let raw = match extract_value(expr) {
        Some(Value::Number(s, _)) | Some(Value::SingleQuotedString(s)) => s.clone(),
        _ => return Err(SqlError::Parse(format!("expected amount, got {expr}"))),
    };
    raw.parse::<Money>().map_err(SqlError::Parse)
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    match extract_value(expr) {
        Some(Value::Boolean(b)) => Ok(*b),
        Some(Value::SingleQuotedString(s)) => match s.to_lowercase().as_str() {
            "true" | "t" | "1" => Ok(true),
            "false" | "f" | "0" => Ok(false),
            _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
        },
        Some(Value::Number(n, _)) => Ok(n != "0"),
        Some(value) => Err(SqlError::Parse(format!("expected bool, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

/// `ARRAY['wifi', 'projector']`, a JSON array string, or a comma-separated string.
fn parse_amenities(expr: &Expr) -> Result<Vec<String>, SqlError> {
    if let Expr::Array(array) = expr {
        return array.elem.iter().map(parse_text).collect();
    }
    let raw = match parse_text_or_null(expr)? {
        Some(raw) => raw,
        None => return Ok(Vec::new()),
    };
    let trimmed = raw.trim();
    if trimmed.starts_with('[') {
        return serde_json::from_str(trimmed).map_err(|e| SqlError::Parse(format!("bad amenities: {e}")));
    }
    Ok(trimmed
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect())
}

fn parse_roles(expr: &Expr) -> Result<BTreeSet<Role>, SqlError> {
    let raw = parse_text(expr)?;
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<Role>().map_err(SqlError::Parse))
        .collect()
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(&'static str, String),
    MissingColumn(&'static str, &'static str),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
    UnsupportedFilter(String),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(t, c) => write!(f, "unknown column {t}.{c}"),
            SqlError::MissingColumn(t, c) => write!(f, "{t}: missing required column {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::UnsupportedFilter(e) => write!(f, "unsupported filter: {e}"),
        }
    }
}

impl std::error::Error for SqlError {}
