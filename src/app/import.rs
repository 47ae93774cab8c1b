//! CSV import shared by the server (`POST /api/import/{kind}`) and the
//! `crm import` command.
//!
//! An import runs in three steps:
//! 1. [`parse_csv`] reads the header, checks the template's required
//!    columns and collects the data records with their line numbers.
//! 2. Each record is turned into a typed create payload by the
//!    [`ImportTemplate`]; field problems are recorded against the line.
//! 3. Valid payloads are handed one at a time to a [`RowSink`]. A failed
//!    submission is recorded and the import moves on to the next row.
//!
//! Nothing is batched and rows are not transactional with each other.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::NaiveDate;
use csv::{ReaderBuilder, StringRecord, Trim};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::db::DbHandle;
use super::models::*;
use super::validate::{check_email, check_phone, slugify};
use super::ws::{ChangeEvent, WsMessage, broadcast_message};
use crate::errors::{CrmError, ImportError};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ImportKind {
    Leads,
    Tasks,
    ServiceOrders,
    Projects,
    Users,
}

impl ImportKind {
    pub const ALL: [ImportKind; 5] = [
        Self::Leads,
        Self::Tasks,
        Self::ServiceOrders,
        Self::Projects,
        Self::Users,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Leads => "leads",
            Self::Tasks => "tasks",
            Self::ServiceOrders => "service-orders",
            Self::Projects => "projects",
            Self::Users => "users",
        }
    }

    pub fn template(&self) -> &'static dyn ImportTemplate {
        match self {
            Self::Leads => &LeadTemplate,
            Self::Tasks => &TaskTemplate,
            Self::ServiceOrders => &ServiceOrderTemplate,
            Self::Projects => &ProjectTemplate,
            Self::Users => &UserTemplate,
        }
    }
}

impl std::fmt::Display for ImportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImportKind {
    type Err = ImportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('_', "-").as_str() {
            "leads" => Ok(Self::Leads),
            "tasks" => Ok(Self::Tasks),
            "service-orders" => Ok(Self::ServiceOrders),
            "projects" => Ok(Self::Projects),
            "users" => Ok(Self::Users),
            _ => Err(ImportError::UnknownKind(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RowError {
    /// 1-based line in the file; the header is line 1.
    pub line: u64,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ImportReport {
    pub kind: ImportKind,
    pub total_rows: usize,
    pub imported: usize,
    pub errors: Vec<RowError>,
}

/// A typed create request built from one CSV row.
#[derive(Debug, Clone)]
pub enum ImportPayload {
    Lead(NewLead),
    Task(NewTask),
    ServiceOrder(NewServiceOrder),
    Project(NewProject),
    User(NewUser),
}

// ── Parsing ──────────────────────────────────────────────────────────

/// One data record with access by (lowercased) column name.
pub struct CsvRow<'a> {
    headers: &'a [String],
    record: &'a StringRecord,
}

impl CsvRow<'_> {
    /// Trimmed field value; columns absent from the header or the record
    /// read as empty.
    pub fn get(&self, column: &str) -> &str {
        self.headers
            .iter()
            .position(|h| h == column)
            .and_then(|idx| self.record.get(idx))
            .map(str::trim)
            .unwrap_or("")
    }

    pub fn optional(&self, column: &str) -> Option<String> {
        Some(self.get(column)).filter(|v| !v.is_empty()).map(String::from)
    }

    pub fn required(&self, column: &str) -> Result<&str, String> {
        let value = self.get(column);
        if value.is_empty() {
            Err(format!("{} is required", column))
        } else {
            Ok(value)
        }
    }
}

/// Parsed CSV ready for submission.
#[derive(Debug, Clone)]
pub struct CsvTable {
    pub headers: Vec<String>,
    pub rows: Vec<(u64, StringRecord)>,
}

impl CsvTable {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Read the header and data records, rejecting files that lack any of the
/// template's required columns. Blank lines are skipped.
pub fn parse_csv(input: &str, template: &dyn ImportTemplate) -> Result<CsvTable, ImportError> {
    let input = input.strip_prefix('\u{feff}').unwrap_or(input);
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(Trim::All)
        .from_reader(input.as_bytes());

    let headers: Vec<String> = reader
        .headers()
        .map_err(ImportError::Header)?
        .iter()
        .map(|h| h.trim().to_lowercase())
        .collect();
    if headers.iter().all(|h| h.is_empty()) {
        return Err(ImportError::Empty);
    }

    let missing: Vec<String> = template
        .required()
        .iter()
        .filter(|col| !headers.iter().any(|h| h == *col))
        .map(|col| col.to_string())
        .collect();
    if !missing.is_empty() {
        return Err(ImportError::MissingColumns { missing });
    }

    let mut rows = Vec::new();
    for result in reader.records() {
        let record = result.map_err(ImportError::Header)?;
        if record.iter().all(|field| field.trim().is_empty()) {
            continue;
        }
        let line = record.position().map(|p| p.line()).unwrap_or(0);
        rows.push((line, record));
    }
    Ok(CsvTable { headers, rows })
}

// ── Templates ────────────────────────────────────────────────────────

/// Column layout of one import kind and the mapping from a row to its
/// create payload.
pub trait ImportTemplate: Send + Sync {
    fn kind(&self) -> ImportKind;

    /// Every column the template understands, in canonical order.
    fn columns(&self) -> &'static [&'static str];

    /// Columns the header must contain.
    fn required(&self) -> &'static [&'static str];

    fn parse_row(&self, row: &CsvRow<'_>) -> Result<ImportPayload, String>;

    /// Header line of an empty template file.
    fn header_line(&self) -> String {
        self.columns().join(",")
    }
}

fn validation_message(err: CrmError) -> String {
    match err {
        CrmError::Validation(message) => message,
        other => other.to_string(),
    }
}

/// `YYYY-MM-DD` or `DD/MM/YYYY`.
pub fn parse_date(column: &str, value: &str) -> Result<Option<NaiveDate>, String> {
    if value.is_empty() {
        return Ok(None);
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(value, "%d/%m/%Y"))
        .map(Some)
        .map_err(|_| format!("{} '{}' is not a date (use YYYY-MM-DD or DD/MM/YYYY)", column, value))
}

fn parse_priority(value: &str) -> Result<Option<Priority>, String> {
    if value.is_empty() {
        return Ok(None);
    }
    match slugify(value, '_').as_str() {
        "low" | "baixa" => Ok(Some(Priority::Low)),
        "medium" | "media" | "normal" => Ok(Some(Priority::Medium)),
        "high" | "alta" => Ok(Some(Priority::High)),
        "urgent" | "urgente" => Ok(Some(Priority::Urgent)),
        _ => Err(format!("prioridade '{}' is not recognised", value)),
    }
}

fn parse_task_status(value: &str) -> Result<Option<TaskStatus>, String> {
    if value.is_empty() {
        return Ok(None);
    }
    match slugify(value, '_').as_str() {
        "todo" | "a_fazer" | "pendente" => Ok(Some(TaskStatus::Todo)),
        "in_progress" | "em_andamento" | "andamento" => Ok(Some(TaskStatus::InProgress)),
        "done" | "concluida" | "concluido" | "feito" => Ok(Some(TaskStatus::Done)),
        _ => Err(format!("status '{}' is not recognised", value)),
    }
}

fn parse_project_status(value: &str) -> Result<Option<ProjectStatus>, String> {
    if value.is_empty() {
        return Ok(None);
    }
    match slugify(value, '_').as_str() {
        "planning" | "planejamento" => Ok(Some(ProjectStatus::Planning)),
        "active" | "ativo" | "em_andamento" => Ok(Some(ProjectStatus::Active)),
        "on_hold" | "pausado" | "em_espera" => Ok(Some(ProjectStatus::OnHold)),
        "completed" | "concluido" => Ok(Some(ProjectStatus::Completed)),
        "cancelled" | "cancelado" => Ok(Some(ProjectStatus::Cancelled)),
        _ => Err(format!("status '{}' is not recognised", value)),
    }
}

pub struct LeadTemplate;

impl ImportTemplate for LeadTemplate {
    fn kind(&self) -> ImportKind {
        ImportKind::Leads
    }

    fn columns(&self) -> &'static [&'static str] {
        &["nome", "email", "telefone", "empresa", "status", "origem"]
    }

    fn required(&self) -> &'static [&'static str] {
        &["nome", "email"]
    }

    fn parse_row(&self, row: &CsvRow<'_>) -> Result<ImportPayload, String> {
        let name = row.required("nome")?;
        let email = row.required("email")?;
        check_email(Some(email)).map_err(validation_message)?;
        let phone = row.optional("telefone");
        check_phone(phone.as_deref()).map_err(validation_message)?;
        Ok(ImportPayload::Lead(NewLead {
            name: name.to_string(),
            email: Some(email.to_string()),
            phone,
            company: row.optional("empresa"),
            status: row.optional("status").map(|s| slugify(&s, '_')),
            origin: row.optional("origem"),
            ..Default::default()
        }))
    }
}

pub struct TaskTemplate;

impl ImportTemplate for TaskTemplate {
    fn kind(&self) -> ImportKind {
        ImportKind::Tasks
    }

    fn columns(&self) -> &'static [&'static str] {
        &["titulo", "descricao", "status", "prioridade", "vencimento"]
    }

    fn required(&self) -> &'static [&'static str] {
        &["titulo"]
    }

    fn parse_row(&self, row: &CsvRow<'_>) -> Result<ImportPayload, String> {
        Ok(ImportPayload::Task(NewTask {
            title: row.required("titulo")?.to_string(),
            description: row.optional("descricao"),
            status: parse_task_status(row.get("status"))?,
            priority: parse_priority(row.get("prioridade"))?,
            due_date: parse_date("vencimento", row.get("vencimento"))?,
            ..Default::default()
        }))
    }
}

pub struct ServiceOrderTemplate;

impl ImportTemplate for ServiceOrderTemplate {
    fn kind(&self) -> ImportKind {
        ImportKind::ServiceOrders
    }

    fn columns(&self) -> &'static [&'static str] {
        &["titulo", "descricao", "projeto_id", "prioridade", "vencimento"]
    }

    fn required(&self) -> &'static [&'static str] {
        &["titulo", "projeto_id"]
    }

    fn parse_row(&self, row: &CsvRow<'_>) -> Result<ImportPayload, String> {
        let title = row.required("titulo")?;
        let raw_project = row.required("projeto_id")?;
        let project_id = raw_project
            .parse::<i64>()
            .map_err(|_| format!("projeto_id '{}' is not a number", raw_project))?;
        Ok(ImportPayload::ServiceOrder(NewServiceOrder {
            project_id,
            title: title.to_string(),
            description: row.optional("descricao"),
            priority: parse_priority(row.get("prioridade"))?,
            due_date: parse_date("vencimento", row.get("vencimento"))?,
            ..Default::default()
        }))
    }
}

pub struct ProjectTemplate;

impl ImportTemplate for ProjectTemplate {
    fn kind(&self) -> ImportKind {
        ImportKind::Projects
    }

    fn columns(&self) -> &'static [&'static str] {
        &["nome", "descricao", "status", "inicio", "prazo"]
    }

    fn required(&self) -> &'static [&'static str] {
        &["nome"]
    }

    fn parse_row(&self, row: &CsvRow<'_>) -> Result<ImportPayload, String> {
        Ok(ImportPayload::Project(NewProject {
            name: row.required("nome")?.to_string(),
            description: row.optional("descricao"),
            status: parse_project_status(row.get("status"))?,
            start_date: parse_date("inicio", row.get("inicio"))?,
            due_date: parse_date("prazo", row.get("prazo"))?,
            ..Default::default()
        }))
    }
}

pub struct UserTemplate;

impl ImportTemplate for UserTemplate {
    fn kind(&self) -> ImportKind {
        ImportKind::Users
    }

    fn columns(&self) -> &'static [&'static str] {
        &["nome", "email", "papel"]
    }

    fn required(&self) -> &'static [&'static str] {
        &["nome", "email"]
    }

    fn parse_row(&self, row: &CsvRow<'_>) -> Result<ImportPayload, String> {
        let name = row.required("nome")?;
        let email = row.required("email")?;
        check_email(Some(email)).map_err(validation_message)?;
        let role = match slugify(row.get("papel"), '_').as_str() {
            "" | "member" | "membro" => Role::Member,
            "admin" | "administrador" => Role::Admin,
            other => return Err(format!("papel '{}' must be admin or member", other)),
        };
        Ok(ImportPayload::User(NewUser {
            name: name.to_string(),
            email: email.to_string(),
            role: Some(role),
        }))
    }
}

// ── Submission ───────────────────────────────────────────────────────

/// Destination for validated rows. Returns the row's error message when
/// the create call fails.
#[async_trait]
pub trait RowSink: Send + Sync {
    async fn submit(&self, payload: ImportPayload) -> Result<(), String>;
}

/// Submit every row in file order, awaiting each create call before the
/// next. Row failures never abort the import.
pub async fn run_import(
    template: &dyn ImportTemplate,
    table: &CsvTable,
    sink: &dyn RowSink,
) -> ImportReport {
    let mut report = ImportReport {
        kind: template.kind(),
        total_rows: table.len(),
        imported: 0,
        errors: Vec::new(),
    };
    for (line, record) in &table.rows {
        let row = CsvRow {
            headers: &table.headers,
            record,
        };
        let outcome = match template.parse_row(&row) {
            Ok(payload) => sink.submit(payload).await,
            Err(message) => Err(message),
        };
        match outcome {
            Ok(()) => report.imported += 1,
            Err(message) => {
                tracing::warn!(kind = %report.kind, line, %message, "import row rejected");
                report.errors.push(RowError {
                    line: *line,
                    message,
                });
            }
        }
    }
    tracing::info!(
        kind = %report.kind,
        total = report.total_rows,
        imported = report.imported,
        failed = report.errors.len(),
        "import finished"
    );
    report
}

/// Parse `input` with the kind's template and submit it to `sink`.
pub async fn import_csv(
    kind: ImportKind,
    input: &str,
    sink: &dyn RowSink,
) -> Result<ImportReport, ImportError> {
    let template = kind.template();
    let table = parse_csv(input, template)?;
    Ok(run_import(template, &table, sink).await)
}

/// Writes rows straight into an organization's tables.
pub struct DbSink {
    db: DbHandle,
    org_id: i64,
    events: Option<broadcast::Sender<ChangeEvent>>,
}

impl DbSink {
    pub fn new(db: DbHandle, org_id: i64) -> Self {
        Self {
            db,
            org_id,
            events: None,
        }
    }

    /// Also publish a created event for every imported row.
    pub fn with_events(mut self, tx: broadcast::Sender<ChangeEvent>) -> Self {
        self.events = Some(tx);
        self
    }
}

#[async_trait]
impl RowSink for DbSink {
    async fn submit(&self, payload: ImportPayload) -> Result<(), String> {
        let org_id = self.org_id;
        let created = self
            .db
            .call(move |db| {
                Ok(match payload {
                    ImportPayload::Lead(new) => {
                        Some(WsMessage::LeadCreated { lead: db.create_lead(org_id, &new)? })
                    }
                    ImportPayload::Task(new) => {
                        Some(WsMessage::TaskCreated { task: db.create_task(org_id, &new)? })
                    }
                    ImportPayload::ServiceOrder(new) => Some(WsMessage::ServiceOrderCreated {
                        service_order: db.create_service_order(org_id, &new)?,
                    }),
                    ImportPayload::Project(new) => Some(WsMessage::ProjectCreated {
                        project: db.create_project(org_id, &new)?,
                    }),
                    ImportPayload::User(new) => {
                        db.create_user(Some(org_id), &new)?;
                        None
                    }
                })
            })
            .await
            .map_err(|e| match e.downcast::<CrmError>() {
                Ok(crm) => validation_message(crm),
                Err(other) => other.to_string(),
            })?;
        if let (Some(tx), Some(msg)) = (&self.events, created) {
            broadcast_message(tx, org_id, msg);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::app::db::CrmDb;

    /// Records payloads and fails rows whose name/title starts with "fail".
    #[derive(Default)]
    struct RecordingSink {
        seen: Mutex<Vec<ImportPayload>>,
    }

    #[async_trait]
    impl RowSink for RecordingSink {
        async fn submit(&self, payload: ImportPayload) -> Result<(), String> {
            let name = match &payload {
                ImportPayload::Lead(l) => l.name.clone(),
                ImportPayload::Task(t) => t.title.clone(),
                ImportPayload::ServiceOrder(o) => o.title.clone(),
                ImportPayload::Project(p) => p.name.clone(),
                ImportPayload::User(u) => u.name.clone(),
            };
            self.seen.lock().unwrap().push(payload);
            if name.starts_with("fail") {
                Err("rejected by server".into())
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn test_valid_and_invalid_rows_are_counted_with_lines() {
        let csv = "nome,email,telefone,empresa,status,origem\n\
                   Ana,ana@x.com,(11) 98765-4321,Acme,,site\n\
                   ,semnome@x.com,,,,\n\
                   Bruno,bruno.x.com,,,,\n\
                   \n\
                   Carla,carla@x.com,,,,\n\
                   Davi,davi@x.com,12ab,,,\n";
        let sink = RecordingSink::default();
        let report = import_csv(ImportKind::Leads, csv, &sink).await.unwrap();

        assert_eq!(report.total_rows, 5);
        assert_eq!(report.imported, 2);
        let lines: Vec<u64> = report.errors.iter().map(|e| e.line).collect();
        assert_eq!(lines, vec![3, 4, 7]);
        assert!(report.errors[0].message.contains("nome"));
        assert!(report.errors[1].message.contains("email"));
        assert_eq!(sink.seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_sink_failures_are_recorded_and_import_continues() {
        let csv = "titulo,descricao,status,prioridade,vencimento\n\
                   fail one,,,,\n\
                   Ligar,,Em andamento,alta,05/03/2024\n";
        let sink = RecordingSink::default();
        let report = import_csv(ImportKind::Tasks, csv, &sink).await.unwrap();
        assert_eq!(report.imported, 1);
        assert_eq!(report.errors, vec![RowError { line: 2, message: "rejected by server".into() }]);

        let seen = sink.seen.lock().unwrap();
        let ImportPayload::Task(task) = &seen[1] else {
            panic!("expected a task payload");
        };
        assert_eq!(task.status, Some(TaskStatus::InProgress));
        assert_eq!(task.priority, Some(Priority::High));
        assert_eq!(task.due_date, NaiveDate::from_ymd_opt(2024, 3, 5));
    }

    #[test]
    fn test_missing_required_columns_is_fatal() {
        let err = parse_csv("nome,telefone\nAna,123\n", &LeadTemplate).unwrap_err();
        match err {
            ImportError::MissingColumns { missing } => assert_eq!(missing, vec!["email"]),
            other => panic!("unexpected error: {other}"),
        }
        assert!(matches!(parse_csv("", &LeadTemplate), Err(ImportError::Empty)));
    }

    #[test]
    fn test_header_matching_is_case_insensitive_and_order_free() {
        let table = parse_csv(" Email , NOME \nana@x.com,Ana\n", &LeadTemplate).unwrap();
        let row = CsvRow { headers: &table.headers, record: &table.rows[0].1 };
        assert_eq!(row.get("nome"), "Ana");
        assert_eq!(row.get("empresa"), "");
    }

    #[test]
    fn test_quoted_fields_and_short_rows() {
        let csv = "nome,email,telefone,empresa\n\"Silva, Souza & Cia\",s@x.com\n";
        let table = parse_csv(csv, &LeadTemplate).unwrap();
        let row = CsvRow { headers: &table.headers, record: &table.rows[0].1 };
        assert_eq!(row.get("nome"), "Silva, Souza & Cia");
        assert_eq!(row.get("telefone"), "");
        assert_eq!(table.rows[0].0, 2);
    }

    #[test]
    fn test_service_order_row_needs_numeric_project() {
        let table = parse_csv("titulo,projeto_id\nTroca,abc\n", &ServiceOrderTemplate).unwrap();
        let row = CsvRow { headers: &table.headers, record: &table.rows[0].1 };
        let err = ServiceOrderTemplate.parse_row(&row).unwrap_err();
        assert!(err.contains("projeto_id"));
    }

    #[test]
    fn test_dates_and_roles() {
        assert_eq!(parse_date("prazo", "2024-12-01").unwrap(), NaiveDate::from_ymd_opt(2024, 12, 1));
        assert_eq!(parse_date("prazo", "01/12/2024").unwrap(), NaiveDate::from_ymd_opt(2024, 12, 1));
        assert!(parse_date("prazo", "12-01-2024").is_err());

        let table = parse_csv("nome,email,papel\nAna,a@x.com,Administrador\nBia,b@x.com,chefe\n", &UserTemplate).unwrap();
        let first = CsvRow { headers: &table.headers, record: &table.rows[0].1 };
        assert!(matches!(UserTemplate.parse_row(&first), Ok(ImportPayload::User(NewUser { role: Some(Role::Admin), .. }))));
        let second = CsvRow { headers: &table.headers, record: &table.rows[1].1 };
        assert!(UserTemplate.parse_row(&second).is_err());
    }

    #[test]
    fn test_import_kind_parsing() {
        assert_eq!("service_orders".parse::<ImportKind>().unwrap(), ImportKind::ServiceOrders);
        assert_eq!("Leads".parse::<ImportKind>().unwrap(), ImportKind::Leads);
        assert!("invoices".parse::<ImportKind>().is_err());
        assert_eq!(ImportKind::Projects.template().header_line(), "nome,descricao,status,inicio,prazo");
    }

    #[tokio::test]
    async fn test_db_sink_imports_leads_into_pipeline() {
        let db = CrmDb::new_in_memory().unwrap();
        let plan = db
            .create_plan(&NewPlan {
                name: "Mini".into(),
                max_users: None,
                max_leads: Some(2),
                max_projects: None,
                max_service_orders: None,
                price_cents: 0,
            })
            .unwrap();
        let org = db
            .create_organization(&NewOrganization { name: "Loja".into(), plan_id: plan.id, slug: None })
            .unwrap();
        let handle = DbHandle::new(db);
        let (tx, mut rx) = broadcast::channel(16);
        let sink = DbSink::new(handle.clone(), org.id).with_events(tx);

        let csv = "nome,email,status\nA,a@x.com,Negociação\nB,b@x.com,inexistente\nC,c@x.com,\nD,d@x.com,\n";
        let report = import_csv(ImportKind::Leads, csv, &sink).await.unwrap();

        assert_eq!(report.imported, 2);
        assert_eq!(report.errors.len(), 2);
        assert_eq!(report.errors[0].line, 3);
        assert!(report.errors[0].message.contains("unknown stage"));
        assert_eq!(report.errors[1].line, 5);
        assert!(report.errors[1].message.contains("Plan limit"));

        let first = rx.recv().await.unwrap();
        match first.event {
            WsMessage::LeadCreated { lead } => assert_eq!(lead.status, "negociacao"),
            other => panic!("unexpected event {other:?}"),
        }
    }
}
