use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Executor, FromRow, PgPool};
use std::str::FromStr;

use super::store::DocumentStore;
use crate::error::{AppError, AppResult};
use crate::models::{
    Company, ContactUpdate, DocType, Document, DocumentStatus, MatchResult, NewCompany,
    NewDocument, ParseOutput,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS companies (
    id             BIGSERIAL PRIMARY KEY,
    name           TEXT NOT NULL,
    contact_person TEXT,
    email          TEXT,
    created_at     TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS documents (
    id          BIGSERIAL PRIMARY KEY,
    company_id  BIGINT NOT NULL REFERENCES companies(id),
    doc_type    TEXT NOT NULL,
    filename    TEXT NOT NULL,
    status      TEXT NOT NULL DEFAULT 'PENDING_PARSE',
    ocr_text    TEXT,
    parsed_json TEXT,
    uploaded_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE INDEX IF NOT EXISTS idx_documents_company ON documents(company_id, uploaded_at DESC);

CREATE TABLE IF NOT EXISTS match_results (
    id                  BIGSERIAL PRIMARY KEY,
    company_id          BIGINT NOT NULL REFERENCES companies(id),
    po_document_id      BIGINT NOT NULL REFERENCES documents(id),
    invoice_document_id BIGINT NOT NULL REFERENCES documents(id),
    overall_status      TEXT NOT NULL,
    confidence_score    DOUBLE PRECISION NOT NULL,
    report_path         TEXT NOT NULL,
    payload             TEXT NOT NULL,
    created_at          TIMESTAMPTZ NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_match_results_pair ON match_results(po_document_id, invoice_document_id, id DESC);
"#;

/// 单据表行
#[derive(Debug, Clone, FromRow)]
struct DocumentRow {
    id: i64,
    company_id: i64,
    doc_type: String,
    filename: String,
    status: String,
    ocr_text: Option<String>,
    parsed_json: Option<String>,
    uploaded_at: DateTime<Utc>,
}

impl TryFrom<DocumentRow> for Document {
    type Error = AppError;

    fn try_from(row: DocumentRow) -> Result<Self, Self::Error> {
        let parsed_json = row
            .parsed_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;
        Ok(Document {
            id: row.id,
            company_id: row.company_id,
            doc_type: DocType::from_str(&row.doc_type).map_err(AppError::Storage)?,
            filename: row.filename,
            status: DocumentStatus::from_str(&row.status).map_err(AppError::Storage)?,
            ocr_text: row.ocr_text,
            parsed_json,
            uploaded_at: row.uploaded_at,
        })
    }
}

/// 匹配结果表行 (完整结果以 JSON 文本保存)
#[derive(Debug, Clone, FromRow)]
struct MatchRow {
    id: i64,
    payload: String,
}

impl TryFrom<MatchRow> for MatchResult {
    type Error = AppError;

    fn try_from(row: MatchRow) -> Result<Self, Self::Error> {
        let mut result: MatchResult = serde_json::from_str(&row.payload)?;
        result.id = Some(row.id);
        Ok(result)
    }
}

const DOCUMENT_COLUMNS: &str =
    "id, company_id, doc_type, filename, status, ocr_text, parsed_json, uploaded_at";

/// PostgreSQL 单据存储
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// 建表 (幂等)
    pub async fn ensure_schema(&self) -> Result<(), sqlx::Error> {
        (&self.pool).execute(SCHEMA).await?;
        tracing::info!("Database schema ready");
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for PgStore {
    async fn create_company(&self, company: NewCompany) -> AppResult<Company> {
        let company = sqlx::query_as::<_, Company>(
            r#"
            INSERT INTO companies (name, contact_person, email)
            VALUES ($1, $2, $3)
            RETURNING id, name, contact_person, email, created_at
            "#,
        )
        .bind(&company.name)
        .bind(&company.contact_person)
        .bind(&company.email)
        .fetch_one(&self.pool)
        .await?;
        Ok(company)
    }

    async fn get_company(&self, company_id: i64) -> AppResult<Option<Company>> {
        let company = sqlx::query_as::<_, Company>(
            r#"
            SELECT id, name, contact_person, email, created_at
            FROM companies
            WHERE id = $1
            "#,
        )
        .bind(company_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(company)
    }

    async fn list_companies(&self) -> AppResult<Vec<Company>> {
        let companies = sqlx::query_as::<_, Company>(
            "SELECT id, name, contact_person, email, created_at FROM companies ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(companies)
    }

    async fn update_company_contact(
        &self,
        company_id: i64,
        update: ContactUpdate,
    ) -> AppResult<Option<Company>> {
        let company = sqlx::query_as::<_, Company>(
            r#"
            UPDATE companies
            SET contact_person = COALESCE($2, contact_person),
                email = COALESCE($3, email)
            WHERE id = $1
            RETURNING id, name, contact_person, email, created_at
            "#,
        )
        .bind(company_id)
        .bind(&update.contact_person)
        .bind(&update.email)
        .fetch_optional(&self.pool)
        .await?;
        Ok(company)
    }

    async fn create_document(&self, document: NewDocument) -> AppResult<Document> {
        let row = sqlx::query_as::<_, DocumentRow>(&format!(
            r#"
            INSERT INTO documents (company_id, doc_type, filename, status)
            VALUES ($1, $2, $3, $4)
            RETURNING {DOCUMENT_COLUMNS}
            "#
        ))
        .bind(document.company_id)
        .bind(document.doc_type.as_str())
        .bind(&document.filename)
        .bind(DocumentStatus::PendingParse.as_str())
        .fetch_one(&self.pool)
        .await?;
        row.try_into()
    }

    async fn get_document(&self, document_id: i64) -> AppResult<Option<Document>> {
        sqlx::query_as::<_, DocumentRow>(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents WHERE id = $1"
        ))
        .bind(document_id)
        .fetch_optional(&self.pool)
        .await?
        .map(Document::try_from)
        .transpose()
    }

    async fn list_documents(&self, company_id: i64) -> AppResult<Vec<Document>> {
        sqlx::query_as::<_, DocumentRow>(&format!(
            r#"
            SELECT {DOCUMENT_COLUMNS}
            FROM documents
            WHERE company_id = $1
            ORDER BY uploaded_at DESC, id DESC
            "#
        ))
        .bind(company_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(Document::try_from)
        .collect()
    }

    async fn attach_parse_output(
        &self,
        document_id: i64,
        output: ParseOutput,
    ) -> AppResult<Option<Document>> {
        let parsed = serde_json::to_string(&output.parsed_json)?;
        sqlx::query_as::<_, DocumentRow>(&format!(
            r#"
            UPDATE documents
            SET parsed_json = $2,
                ocr_text = COALESCE($3, ocr_text),
                status = $4
            WHERE id = $1
            RETURNING {DOCUMENT_COLUMNS}
            "#
        ))
        .bind(document_id)
        .bind(parsed)
        .bind(&output.ocr_text)
        .bind(DocumentStatus::Parsed.as_str())
        .fetch_optional(&self.pool)
        .await?
        .map(Document::try_from)
        .transpose()
    }

    async fn insert_match(&self, mut result: MatchResult) -> AppResult<MatchResult> {
        let start = std::time::Instant::now();
        let payload = serde_json::to_string(&result)?;
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO match_results (
                company_id, po_document_id, invoice_document_id,
                overall_status, confidence_score, report_path, payload, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING id
            "#,
        )
        .bind(result.company_id)
        .bind(result.po_document_id)
        .bind(result.invoice_document_id)
        .bind(result.overall_status.as_str())
        .bind(result.confidence_score)
        .bind(&result.report_path)
        .bind(payload)
        .bind(result.created_at)
        .fetch_one(&self.pool)
        .await?;

        tracing::debug!("✓ 匹配结果 {} 写入完成, 耗时: {:?}", id, start.elapsed());
        result.id = Some(id);
        Ok(result)
    }

    async fn get_match(&self, match_id: i64) -> AppResult<Option<MatchResult>> {
        sqlx::query_as::<_, MatchRow>("SELECT id, payload FROM match_results WHERE id = $1")
            .bind(match_id)
            .fetch_optional(&self.pool)
            .await?
            .map(MatchResult::try_from)
            .transpose()
    }

    async fn delete_match(&self, match_id: i64) -> AppResult<bool> {
        let affected = sqlx::query("DELETE FROM match_results WHERE id = $1")
            .bind(match_id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(affected > 0)
    }

    async fn latest_match(
        &self,
        po_document_id: i64,
        invoice_document_id: i64,
    ) -> AppResult<Option<MatchResult>> {
        sqlx::query_as::<_, MatchRow>(
            r#"
            SELECT id, payload
            FROM match_results
            WHERE po_document_id = $1
              AND invoice_document_id = $2
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .bind(po_document_id)
        .bind(invoice_document_id)
        .fetch_optional(&self.pool)
        .await?
        .map(MatchResult::try_from)
        .transpose()
    }
}
