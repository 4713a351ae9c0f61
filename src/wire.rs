use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::StartupHandler;
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::{SpacebookStartupHandler, SESSION_USER_ID};
use crate::engine::{Engine, EngineError, Outcome};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command};

pub struct SpacebookHandler {
    engine: Arc<Engine>,
    query_parser: Arc<SpacebookQueryParser>,
}

impl SpacebookHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(SpacebookQueryParser),
        }
    }

    /// The account pinned at login; sessions without one are anonymous.
    fn resolve_requester<C: ClientInfo>(&self, client: &C) -> Requester {
        let user_id = client
            .metadata()
            .get(SESSION_USER_ID)
            .and_then(|id| id.parse::<ulid::Ulid>().ok());
        self.engine.requester_for(user_id)
    }

    async fn run(&self, requester: &Requester, query: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(requester, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, requester: &Requester, cmd: Command) -> PgWireResult<Response> {
        let engine = &self.engine;
        match cmd {
            // ── Users ──
            Command::InsertUser(new) => {
                engine.register_user(new).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::UpdateProfile { id, patch } => {
                engine
                    .update_profile(requester, id, patch)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::UpdateRoles { id, roles } => {
                engine.set_roles(requester, id, roles).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::SelectProfile => {
                let user = engine.profile(requester).map_err(engine_err)?;
                Ok(user_rows(vec![user]))
            }

            // ── Space Catalog ──
            Command::InsertSpace(space) => {
                engine.create_space(requester, space).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::UpdateSpace { id, patch } => {
                engine
                    .update_space(requester, id, patch)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::DeleteSpace { id } => {
                let removal = engine.delete_space(requester, id).await.map_err(engine_err)?;
                tracing::debug!("delete space {id}: {}", removal.message());
                let tag = match removal {
                    SpaceRemoval::Deleted => Tag::new("DELETE"),
                    SpaceRemoval::Disabled => Tag::new("UPDATE"),
                };
                Ok(Response::Execution(tag.with_rows(1)))
            }
            Command::SelectSpaces { id: Some(id) } => {
                let space = engine.get_space(requester, id).await.map_err(engine_err)?;
                Ok(space_rows(vec![space]))
            }
            Command::SelectSpaces { id: None } => Ok(space_rows(engine.list_spaces(requester).await)),

            // ── Availability ──
            Command::SelectAvailability {
                space_id,
                start,
                end,
                exclude_id,
            } => {
                let available = engine
                    .check_availability(space_id, start, end, exclude_id)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(availability_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&space_id.to_string())?;
                encoder.encode_field(&start)?;
                encoder.encode_field(&end)?;
                encoder.encode_field(&available)?;
                let rows = vec![Ok(encoder.take_row())];
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectFreeSlots { space_id, start, end } => {
                let slots = engine
                    .free_slots(space_id, start, end)
                    .await
                    .map_err(engine_err)?;

                let schema = Arc::new(free_slots_schema());
                let sid = space_id.to_string();
                let rows: Vec<PgWireResult<_>> = slots
                    .into_iter()
                    .map(|slot| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&sid)?;
                        encoder.encode_field(&slot.start)?;
                        encoder.encode_field(&slot.end)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }

            // ── Reservations ──
            Command::InsertReservation(new) => {
                engine
                    .create_reservation(requester, new)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::UpdateReservation { id, patch } => {
                engine
                    .update_reservation(requester, id, patch)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::DeleteReservation { id } => {
                engine
                    .cancel_reservation(requester, id)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectReservations { id: Some(id) } => {
                let reservation = engine
                    .get_reservation(requester, id)
                    .await
                    .map_err(engine_err)?;
                Ok(reservation_rows(vec![reservation]))
            }
            Command::SelectReservations { id: None } => {
                Ok(reservation_rows(engine.list_reservations(requester).await))
            }
            Command::SelectUpcoming => Ok(reservation_rows(engine.upcoming_reservations(requester).await)),
            Command::SelectCalendar { start, end } => {
                let reservations = engine
                    .calendar(requester, start, end)
                    .await
                    .map_err(engine_err)?;
                Ok(reservation_rows(reservations))
            }
        }
    }
}

// ── Result sets ──────────────────────────────────────────────────

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int8_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

fn bool_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::BOOL, FieldFormat::Text)
}

fn user_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("email"),
        text_field("first_name"),
        text_field("last_name"),
        text_field("roles"),
    ]
}

fn space_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("name"),
        text_field("description"),
        text_field("price"),
        int8_field("capacity"),
        text_field("location"),
        text_field("amenities"),
        text_field("image_url"),
        bool_field("is_active"),
    ]
}

fn reservation_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("user_id"),
        text_field("space_id"),
        int8_field("start"),
        int8_field("end"),
        text_field("status"),
        int8_field("attendees"),
        text_field("total_price"),
        text_field("notes"),
        int8_field("created_at"),
        int8_field("updated_at"),
    ]
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        text_field("space_id"),
        int8_field("start"),
        int8_field("end"),
        bool_field("available"),
    ]
}

fn free_slots_schema() -> Vec<FieldInfo> {
    vec![text_field("space_id"), int8_field("start"), int8_field("end")]
}

fn user_rows(users: Vec<User>) -> Response {
    let schema = Arc::new(user_schema());
    let rows: Vec<PgWireResult<_>> = users
        .into_iter()
        .map(|u| {
            let roles: Vec<&str> = u.roles.iter().map(Role::as_str).collect();
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&u.id.to_string())?;
            encoder.encode_field(&u.email)?;
            encoder.encode_field(&u.first_name)?;
            encoder.encode_field(&u.last_name)?;
            encoder.encode_field(&roles.join(","))?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn space_rows(spaces: Vec<Space>) -> Response {
    let schema = Arc::new(space_schema());
    let rows: Vec<PgWireResult<_>> = spaces
        .into_iter()
        .map(|s| {
            let amenities = serde_json::to_string(&s.amenities)
                .map_err(|e| PgWireError::ApiError(Box::new(e)))?;
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&s.id.to_string())?;
            encoder.encode_field(&s.name)?;
            encoder.encode_field(&s.description)?;
            encoder.encode_field(&s.price.to_string())?;
            encoder.encode_field(&i64::from(s.capacity))?;
            encoder.encode_field(&s.location)?;
            encoder.encode_field(&amenities)?;
            encoder.encode_field(&s.image_url)?;
            encoder.encode_field(&s.is_active)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn reservation_rows(reservations: Vec<Reservation>) -> Response {
    let schema = Arc::new(reservation_schema());
    let rows: Vec<PgWireResult<_>> = reservations
        .into_iter()
        .map(|r| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&r.id.to_string())?;
            encoder.encode_field(&r.user_id.to_string())?;
            encoder.encode_field(&r.space_id.to_string())?;
            encoder.encode_field(&r.span.start)?;
            encoder.encode_field(&r.span.end)?;
            encoder.encode_field(&r.status.as_str())?;
            encoder.encode_field(&i64::from(r.attendees))?;
            encoder.encode_field(&r.total_price.to_string())?;
            encoder.encode_field(&r.notes)?;
            encoder.encode_field(&r.created_at)?;
            encoder.encode_field(&r.updated_at)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

/// Result columns for a statement, judged from the relation after `FROM`.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let lower = sql.to_lowercase();
    if !lower.trim_start().starts_with("select") {
        return vec![];
    }
    let table = lower
        .split_once(" from ")
        .and_then(|(_, rest)| rest.split_whitespace().next())
        .map(|t| t.trim_matches(|c| c == '"' || c == ';'));
    match table {
        Some("profile") => user_schema(),
        Some("spaces") => space_schema(),
        Some("reservations") | Some("upcoming_reservations") | Some("calendar") => reservation_schema(),
        Some("availability") => availability_schema(),
        Some("free_slots") => free_slots_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for SpacebookHandler {
    async fn do_query<C>(
        &self,
        client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let requester = self.resolve_requester(client);
        Ok(vec![self.run(&requester, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SpacebookQueryParser;

#[async_trait]
impl QueryParser for SpacebookQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for SpacebookHandler {
    type Statement = String;
    type QueryParser = SpacebookQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let requester = self.resolve_requester(client);
        let sql = substitute_params(portal);
        self.run(&requester, &sql).await
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(
            param_types,
            result_schema(&target.statement),
        ))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(result_schema(
            &target.statement.statement,
        )))
    }
}

/// A statement split at its `$N` placeholders.
#[derive(Debug, PartialEq, Eq)]
enum Piece<'a> {
    Text(&'a str),
    Param(usize),
}

/// Single pass over the SQL. Quoted strings and identifiers are copied
/// whole, so a `$1` inside them stays text.
fn split_placeholders(sql: &str) -> Vec<Piece<'_>> {
    let bytes = sql.as_bytes();
    let mut pieces = Vec::new();
    let mut text_start = 0;
    let mut quote: Option<u8> = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            // A doubled quote closes and reopens, which leaves us inside.
            Some(q) => {
                if b == q {
                    quote = None;
                }
                i += 1;
            }
            None if b == b'\'' || b == b'"' => {
                quote = Some(b);
                i += 1;
            }
            None if b == b'$' => {
                let digits = i + 1;
                let mut end = digits;
                while end < bytes.len() && bytes[end].is_ascii_digit() {
                    end += 1;
                }
                if let Ok(n) = sql[digits..end].parse::<usize>() {
                    pieces.push(Piece::Text(&sql[text_start..i]));
                    pieces.push(Piece::Param(n));
                    text_start = end;
                }
                i = end;
            }
            None => i += 1,
        }
    }
    pieces.push(Piece::Text(&sql[text_start..]));
    pieces
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    split_placeholders(sql)
        .into_iter()
        .filter_map(|piece| match piece {
            Piece::Param(n) => Some(n),
            Piece::Text(_) => None,
        })
        .max()
        .unwrap_or(0)
}

/// Splice text-format values into their placeholders. Every value is sent
/// as a quoted string; the SQL layer accepts quoted numbers. Placeholders
/// without a value are left as they are.
fn bind_params(sql: &str, params: &[Option<String>]) -> String {
    let mut bound = String::with_capacity(sql.len());
    for piece in split_placeholders(sql) {
        match piece {
            Piece::Text(text) => bound.push_str(text),
            Piece::Param(n) => match n.checked_sub(1).and_then(|i| params.get(i)) {
                Some(Some(value)) => {
                    bound.push('\'');
                    bound.push_str(&value.replace('\'', "''"));
                    bound.push('\'');
                }
                Some(None) => bound.push_str("NULL"),
                None => {
                    bound.push('$');
                    bound.push_str(&n.to_string());
                }
            },
        }
    }
    bound
}

fn substitute_params(portal: &Portal<String>) -> String {
    let params: Vec<Option<String>> = portal
        .parameters
        .iter()
        .map(|p| p.as_ref().map(|bytes| String::from_utf8_lossy(bytes).into_owned()))
        .collect();
    bind_params(&portal.statement.statement, &params)
}

// ── Factory ──────────────────────────────────────────────────────

pub struct SpacebookFactory {
    handler: Arc<SpacebookHandler>,
    auth_handler: Arc<SpacebookStartupHandler>,
    noop: Arc<NoopHandler>,
}

impl SpacebookFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        Self {
            handler: Arc::new(SpacebookHandler::new(engine.clone())),
            auth_handler: Arc::new(SpacebookStartupHandler::new(engine, password)),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SpacebookFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = SpacebookFactory::new(engine, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Error mapping ────────────────────────────────────────────────

fn sqlstate(e: &EngineError) -> &'static str {
    match e.outcome() {
        Outcome::NotFound => "P0002",
        Outcome::Invalid => "22023",
        Outcome::Forbidden => "42501",
        Outcome::Conflict => match e {
            EngineError::Conflict(_) => "23P01",
            _ => "23505",
        },
        Outcome::Internal => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    let code = sqlstate(&e);
    match e.outcome() {
        Outcome::Internal => tracing::error!("{e}"),
        _ => tracing::debug!(code, detail = ?e.detail(), "{e}"),
    }
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        e.to_string(),
    )))
}

fn sql_err(e: crate::sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}
