use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{AuthSource, DefaultServerParameterProvider, LoginInfo, Password, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo, QueryResponse,
    Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::engine::{retry_once, Engine, EngineError};
use crate::hours::OpenHours;
use crate::model::*;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command, ResourceChanges};

/// Serve one client connection until it disconnects.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = CourtbookFactory::new(engine, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

pub struct CourtbookHandler {
    engine: Arc<Engine>,
    query_parser: Arc<CourtbookQueryParser>,
}

impl CourtbookHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(CourtbookQueryParser),
        }
    }

    async fn run(&self, query: &str) -> PgWireResult<Vec<Response>> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(cmd).await;
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label).record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        result
    }

    async fn execute_command(&self, cmd: Command) -> PgWireResult<Vec<Response>> {
        let engine = &self.engine;
        match cmd {
            Command::InsertResource {
                id,
                name,
                category,
                timezone,
                slot_minutes,
                max_concurrent,
                open_hours,
            } => {
                let resource = Resource {
                    id,
                    name,
                    category,
                    timezone,
                    slot_minutes,
                    max_concurrent,
                    open_hours: OpenHours::from_legacy_json(&open_hours).map_err(engine_err)?,
                };
                engine.create_resource(resource).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::UpdateResource { id, changes } => {
                let current = engine.get_resource_config(id).await.map_err(engine_err)?;
                let updated = apply_changes(current, changes).map_err(engine_err)?;
                engine.update_resource(updated).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::SelectResources => {
                let resources = engine.list_resources().await;
                let schema = Arc::new(resource_schema());
                let rows: Vec<PgWireResult<_>> = resources
                    .iter()
                    .map(|r| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&r.id.to_string())?;
                        encoder.encode_field(&r.name)?;
                        encoder.encode_field(&r.category)?;
                        encoder.encode_field(&r.timezone)?;
                        encoder.encode_field(&r.slot_minutes)?;
                        encoder.encode_field(&(r.max_concurrent as i64))?;
                        encoder.encode_field(&r.open_hours.to_json())?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectSlots {
                resource_id,
                start,
                end,
                only_available,
            } => {
                let slots = if only_available {
                    engine.list_available_slots(resource_id, start, end).await
                } else {
                    engine.list_slots(resource_id, start, end).await
                }
                .map_err(engine_err)?;

                let schema = Arc::new(slot_schema());
                let rid_str = resource_id.to_string();
                let rows: Vec<PgWireResult<_>> = slots
                    .into_iter()
                    .map(|slot| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&rid_str)?;
                        encoder.encode_field(&slot.span.start)?;
                        encoder.encode_field(&slot.span.end)?;
                        encoder.encode_field(&(slot.occupied as i64))?;
                        encoder.encode_field(&slot.available)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::InsertReservation {
                id,
                resource_id,
                requester_id,
                start,
                slots,
                expires_at,
            } => {
                let placed = match expires_at {
                    Some(expires_at) => {
                        retry_once(|| {
                            engine.hold_reservation(id, resource_id, requester_id.clone(), start, slots, expires_at)
                        })
                        .await
                    }
                    None => {
                        retry_once(|| engine.create_reservation(id, resource_id, requester_id.clone(), start, slots))
                            .await
                    }
                };
                placed.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::RescheduleReservation { id, start } => {
                retry_once(|| engine.reschedule_reservation(id, start))
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::ConfirmReservation { id } => {
                engine.confirm_reservation(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::CancelReservation { id } => {
                engine.cancel_reservation(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::SelectReservations { resource_id, window } => {
                let reservations = engine
                    .list_reservations(resource_id, window)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![reservation_rows(&reservations)])
            }
            Command::SelectReservation { id } => {
                // A missing id is an empty result, not an error.
                let found = match engine.get_reservation(id).await {
                    Ok(r) => vec![r],
                    Err(EngineError::ReservationNotFound(_)) => vec![],
                    Err(e) => return Err(engine_err(e)),
                };
                Ok(vec![reservation_rows(&found)])
            }
            Command::InsertBlackout {
                id,
                resource_id,
                start,
                end,
                reason,
            } => {
                engine
                    .create_blackout(id, resource_id, Span { start, end }, reason)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::DeleteBlackout { id } => {
                engine.delete_blackout(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::SelectBlackouts { resource_id, start, end } => {
                let blackouts = engine
                    .list_blackouts(resource_id, start, end)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(blackout_schema());
                let rows: Vec<PgWireResult<_>> = blackouts
                    .iter()
                    .map(|b| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&b.id.to_string())?;
                        encoder.encode_field(&b.resource_id.to_string())?;
                        encoder.encode_field(&b.span.start)?;
                        encoder.encode_field(&b.span.end)?;
                        encoder.encode_field(&b.reason)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
        }
    }
}

fn apply_changes(mut resource: Resource, changes: ResourceChanges) -> Result<Resource, EngineError> {
    if let Some(name) = changes.name {
        resource.name = name;
    }
    if let Some(category) = changes.category {
        resource.category = category;
    }
    if let Some(timezone) = changes.timezone {
        resource.timezone = timezone;
    }
    if let Some(slot_minutes) = changes.slot_minutes {
        resource.slot_minutes = slot_minutes;
    }
    if let Some(max_concurrent) = changes.max_concurrent {
        resource.max_concurrent = max_concurrent;
    }
    if let Some(open_hours) = changes.open_hours {
        resource.open_hours = OpenHours::from_legacy_json(&open_hours)?;
    }
    Ok(resource)
}

fn reservation_rows(reservations: &[Reservation]) -> Response {
    let schema = Arc::new(reservation_schema());
    let rows: Vec<PgWireResult<_>> = reservations
        .iter()
        .map(|r| {
            let expires_at = match r.status {
                ReservationStatus::Pending { expires_at } => Some(expires_at),
                _ => None,
            };
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&r.id.to_string())?;
            encoder.encode_field(&r.resource_id.to_string())?;
            encoder.encode_field(&r.requester_id)?;
            encoder.encode_field(&r.span.start)?;
            encoder.encode_field(&r.span.end)?;
            encoder.encode_field(&r.status.label().to_string())?;
            encoder.encode_field(&expires_at)?;
            encoder.encode_field(&(r.version as i64))?;
            encoder.encode_field(&r.created_at)?;
            encoder.encode_field(&r.updated_at)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

// ── Result schemas ───────────────────────────────────────────────

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn slot_schema() -> Vec<FieldInfo> {
    vec![
        field("resource_id", Type::VARCHAR),
        field("start", Type::INT8),
        field("end", Type::INT8),
        field("occupied", Type::INT8),
        field("available", Type::BOOL),
    ]
}

fn reservation_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("resource_id", Type::VARCHAR),
        field("requester_id", Type::VARCHAR),
        field("start", Type::INT8),
        field("end", Type::INT8),
        field("status", Type::VARCHAR),
        field("expires_at", Type::INT8),
        field("version", Type::INT8),
        field("created_at", Type::INT8),
        field("updated_at", Type::INT8),
    ]
}

fn blackout_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("resource_id", Type::VARCHAR),
        field("start", Type::INT8),
        field("end", Type::INT8),
        field("reason", Type::VARCHAR),
    ]
}

fn resource_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("name", Type::VARCHAR),
        field("category", Type::VARCHAR),
        field("timezone", Type::VARCHAR),
        field("slot_minutes", Type::INT8),
        field("max_concurrent", Type::INT8),
        field("open_hours", Type::VARCHAR),
    ]
}

/// Row shape of a statement, decided from its text so that statements with
/// unbound `$N` parameters can be described.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    if !upper.trim_start().starts_with("SELECT") {
        return vec![];
    }
    if upper.contains("SLOTS") {
        slot_schema()
    } else if upper.contains("BLACKOUTS") {
        blackout_schema()
    } else if upper.contains("RESERVATIONS") {
        reservation_schema()
    } else if upper.contains("RESOURCES") {
        resource_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for CourtbookHandler {
    async fn do_query<C>(&self, _client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        self.run(query).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct CourtbookQueryParser;

#[async_trait]
impl QueryParser for CourtbookQueryParser {
    type Statement = String;

    async fn parse_sql<C>(&self, _client: &C, sql: &str, _types: &[Option<Type>]) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(&self, stmt: &String, _column_format: Option<&Format>) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for CourtbookHandler {
    type Statement = String;
    type QueryParser = CourtbookQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        _client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let sql = substitute_params(portal);
        let responses = self.run(&sql).await?;
        Ok(responses.into_iter().next().unwrap_or(Response::EmptyQuery))
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
        Ok(DescribeStatementResponse::new(param_types, result_schema(&target.statement)))
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
        Ok(DescribePortalResponse::new(result_schema(&target.statement.statement)))
    }
}

/// `$N` placeholders outside quoted literals, as (byte range, N).
fn placeholders(sql: &str) -> Vec<(std::ops::Range<usize>, usize)> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut in_literal = false;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\'' => {
                in_literal = !in_literal;
                i += 1;
            }
            b'$' if !in_literal => {
                let start = i;
                i += 1;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
                if let Ok(n) = sql[start + 1..i].parse::<usize>() {
                    found.push((start..i, n));
                }
            }
            _ => i += 1,
        }
    }
    found
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    placeholders(sql).into_iter().map(|(_, n)| n).max().unwrap_or(0)
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    bind_params(&portal.statement.statement, &portal.parameters)
}

/// One pass over `sql`: inserted values are never scanned again.
fn bind_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut result = String::with_capacity(sql.len());
    let mut copied = 0;
    for (range, n) in placeholders(sql) {
        let Some(param) = n.checked_sub(1).and_then(|idx| params.get(idx)) else {
            continue;
        };
        result.push_str(&sql[copied..range.start]);
        match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes.as_ref());
                result.push('\'');
                result.push_str(&text.replace('\'', "''"));
                result.push('\'');
            }
            None => result.push_str("NULL"),
        }
        copied = range.end;
    }
    result.push_str(&sql[copied..]);
    result
}

// ── Auth + factory ───────────────────────────────────────────────

/// Single shared password, any user name.
#[derive(Debug)]
pub struct CourtbookAuthSource {
    password: String,
}

impl CourtbookAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for CourtbookAuthSource {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

pub struct CourtbookFactory {
    handler: Arc<CourtbookHandler>,
    auth_handler: Arc<CleartextPasswordAuthStartupHandler<CourtbookAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl CourtbookFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        let auth_source = CourtbookAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(CourtbookHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(auth_source, param_provider)),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for CourtbookFactory {
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

// ── Errors ───────────────────────────────────────────────────────

/// SQLSTATE reported to clients for each engine error.
pub fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::SlotNotOpen(_) => "BK001",
        EngineError::SlotBlackedOut(_) => "BK002",
        EngineError::SlotFull { .. } => "BK003",
        EngineError::ConcurrentModificationConflict(_) => "40001",
        EngineError::ReservationNotFound(_) | EngineError::ResourceNotFound(_) | EngineError::BlackoutNotFound(_) => {
            "P0002"
        }
        EngineError::AlreadyExists(_) => "23505",
        EngineError::InvalidTransition { .. } => "55000",
        EngineError::InvalidResourceConfig(_) => "22023",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::Storage(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate(&e).into(),
        e.to_string(),
    )))
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), "42601".into(), e.to_string())))
}
