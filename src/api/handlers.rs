use axum::{
    extract::{rejection::JsonRejection, Json, Multipart, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::AppState;
use crate::error::{AppError, AppResult};
use crate::models::{Company, ContactUpdate, DocType, Document, MatchResult, NewCompany, NewDocument, ParseOutput};
use crate::service::{with_timeout, MatchRequest};

/// 统一响应体
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            message: None,
            data: Some(data),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

impl<T: Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> Response {
        (StatusCode::OK, Json(self)).into_response()
    }
}

/// 错误响应体
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub kind: &'static str,
    pub detail: String,
    /// 客户端可退避后重试 (存储超时)
    pub retryable: bool,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::InvalidMatchRequest(_) | AppError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Normalization { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::StorageTimeout(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Storage(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!("✗ 请求失败: {}", self);
        }
        let body = ErrorResponse {
            success: false,
            kind: self.kind(),
            detail: self.detail(),
            retryable: self.is_retryable(),
        };
        (status, Json(body)).into_response()
    }
}

/// 健康检查
pub async fn health_check() -> &'static str {
    "OK"
}

#[derive(Debug, Deserialize)]
pub struct CreateCompanyQuery {
    pub name: Option<String>,
    pub contact_person: Option<String>,
    pub email: Option<String>,
}

/// 注册公司
pub async fn create_company(
    State(state): State<AppState>,
    Query(q): Query<CreateCompanyQuery>,
) -> AppResult<ApiResponse<Value>> {
    let name = q.name.map(|n| n.trim().to_string()).unwrap_or_default();
    if name.is_empty() {
        return Err(AppError::InvalidRequest("Company name is required".to_string()));
    }
    let company = state
        .bounded(
            "company create",
            state.store.create_company(NewCompany {
                name,
                contact_person: blank_to_none(q.contact_person),
                email: blank_to_none(q.email),
            }),
        )
        .await?;
    tracing::info!("[Company] 注册公司 {} ({})", company.id, company.name);
    Ok(ApiResponse::ok(json!({ "company_id": company.id })).with_message("Company created"))
}

pub async fn list_companies(State(state): State<AppState>) -> AppResult<ApiResponse<Value>> {
    let companies: Vec<Company> = state
        .bounded("company list", state.store.list_companies())
        .await?;
    Ok(ApiResponse::ok(json!({ "companies": companies })))
}

/// 更新联系人 (名称不可变)
pub async fn update_company_contact(
    State(state): State<AppState>,
    Path(company_id): Path<i64>,
    body: Result<Json<ContactUpdate>, JsonRejection>,
) -> AppResult<ApiResponse<Company>> {
    let Json(update) = body.map_err(|e| AppError::InvalidRequest(e.body_text()))?;
    let company = state
        .bounded(
            "company update",
            state.store.update_company_contact(company_id, update),
        )
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Company {company_id} not found")))?;
    Ok(ApiResponse::ok(company))
}

/// 上传原件: multipart 字段 company_id, doc_type, file
pub async fn upload_document(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> AppResult<ApiResponse<Value>> {
    let mut company_id: Option<String> = None;
    let mut doc_type: Option<String> = None;
    let mut file: Option<(String, Vec<u8>)> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::InvalidRequest(e.body_text()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "company_id" => {
                company_id = Some(field.text().await.map_err(|e| AppError::InvalidRequest(e.body_text()))?)
            }
            "doc_type" => {
                doc_type = Some(field.text().await.map_err(|e| AppError::InvalidRequest(e.body_text()))?)
            }
            "file" => {
                let original = field.file_name().unwrap_or("upload").to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| AppError::InvalidRequest(e.body_text()))?;
                file = Some((original, bytes.to_vec()));
            }
            _ => {}
        }
    }

    let company_id: i64 = company_id
        .as_deref()
        .map(str::trim)
        .and_then(|s| s.parse().ok())
        .filter(|id| *id > 0)
        .ok_or_else(|| AppError::InvalidRequest("company_id must be a positive integer".to_string()))?;
    let doc_type: DocType = doc_type
        .as_deref()
        .ok_or_else(|| AppError::InvalidRequest("doc_type is required".to_string()))?
        .parse()
        .map_err(AppError::InvalidRequest)?;
    let (original, bytes) =
        file.ok_or_else(|| AppError::InvalidRequest("file is required".to_string()))?;

    if state
        .bounded("company fetch", state.store.get_company(company_id))
        .await?
        .is_none()
    {
        return Err(AppError::InvalidRequest(format!("Company {company_id} does not exist")));
    }

    let stored = state.uploads.save(&original, &bytes).await?;
    let created = state
        .bounded(
            "document create",
            state.store.create_document(NewDocument {
                company_id,
                doc_type,
                filename: stored.clone(),
            }),
        )
        .await;
    let document = match created {
        Ok(doc) => doc,
        Err(e) => {
            state.uploads.discard(&stored).await;
            return Err(e);
        }
    };

    tracing::info!(
        "[Upload] company {} 上传 {} 单据 {} -> {}",
        company_id,
        doc_type,
        document.id,
        stored
    );
    Ok(ApiResponse::ok(json!({ "document_id": document.id, "path": stored }))
        .with_message("File uploaded"))
}

pub async fn get_document(
    State(state): State<AppState>,
    Path(document_id): Path<i64>,
) -> AppResult<ApiResponse<Document>> {
    let document = state
        .bounded("document fetch", state.store.get_document(document_id))
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Document {document_id} not found")))?;
    Ok(ApiResponse::ok(document))
}

#[derive(Debug, Deserialize)]
pub struct ListDocumentsQuery {
    pub company_id: Option<i64>,
}

/// 按上传时间倒序
pub async fn list_documents(
    State(state): State<AppState>,
    Query(q): Query<ListDocumentsQuery>,
) -> AppResult<ApiResponse<Value>> {
    let company_id = q
        .company_id
        .ok_or_else(|| AppError::InvalidRequest("company_id is required".to_string()))?;
    let documents = state
        .bounded("document list", state.store.list_documents(company_id))
        .await?;
    Ok(ApiResponse::ok(json!({ "documents": documents })))
}

#[derive(Debug, Deserialize)]
pub struct ParsedBody {
    pub parsed_json: Value,
    pub ocr_text: Option<String>,
}

/// 解析阶段回写；parsed_json 可为对象或包含对象的 JSON 字符串
pub async fn attach_parsed(
    State(state): State<AppState>,
    Path(document_id): Path<i64>,
    body: Result<Json<ParsedBody>, JsonRejection>,
) -> AppResult<ApiResponse<Document>> {
    let Json(body) = body.map_err(|e| AppError::InvalidRequest(e.body_text()))?;
    let parsed_json = parsed_object(body.parsed_json)?;
    let document = state
        .bounded(
            "document update",
            state.store.attach_parse_output(
                document_id,
                ParseOutput {
                    parsed_json,
                    ocr_text: body.ocr_text,
                },
            ),
        )
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Document {document_id} not found")))?;
    tracing::info!("[Parse] 单据 {} 解析结果已写入", document_id);
    Ok(ApiResponse::ok(document))
}

fn parsed_object(value: Value) -> AppResult<Value> {
    let value = match value {
        Value::String(s) => serde_json::from_str(&s).map_err(|_| {
            AppError::InvalidRequest("parsed_json string does not contain valid JSON".to_string())
        })?,
        other => other,
    };
    if value.is_object() {
        Ok(value)
    } else {
        Err(AppError::InvalidRequest("parsed_json must be a JSON object".to_string()))
    }
}

/// RunMatch
pub async fn run_match(
    State(state): State<AppState>,
    body: Result<Json<Value>, JsonRejection>,
) -> AppResult<ApiResponse<MatchResult>> {
    let Json(body) = body.map_err(|e| AppError::InvalidMatchRequest(e.body_text()))?;
    let req = MatchRequest::from_json(&body)?;
    let result = state.matcher.run_match(req).await?;
    Ok(ApiResponse::ok(result))
}

pub async fn get_match(
    State(state): State<AppState>,
    Path(match_id): Path<i64>,
) -> AppResult<ApiResponse<MatchResult>> {
    Ok(ApiResponse::ok(state.matcher.get_match(match_id).await?))
}

#[derive(Debug, Deserialize)]
pub struct LatestMatchQuery {
    pub po_id: Option<i64>,
    pub invoice_id: Option<i64>,
}

pub async fn latest_match(
    State(state): State<AppState>,
    Query(q): Query<LatestMatchQuery>,
) -> AppResult<ApiResponse<MatchResult>> {
    let (Some(po_id), Some(invoice_id)) = (q.po_id, q.invoice_id) else {
        return Err(AppError::InvalidRequest(
            "po_id and invoice_id are required".to_string(),
        ));
    };
    Ok(ApiResponse::ok(state.matcher.latest_match(po_id, invoice_id).await?))
}

/// 下载报告文件 (JSON 或 CSV)
pub async fn get_report(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> AppResult<Response> {
    let bytes = with_timeout(
        state.timeout,
        "report read",
        state.matcher.reports().read(&name),
    )
    .await?;
    let content_type = if name.ends_with(".csv") {
        "text/csv; charset=utf-8"
    } else {
        "application/json"
    };
    Ok(([(header::CONTENT_TYPE, content_type)], bytes).into_response())
}

fn blank_to_none(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parsed_json_accepts_object_or_embedded_string() {
        let obj = json!({"document_number": "PO-1"});
        assert_eq!(parsed_object(obj.clone()).unwrap(), obj);
        assert_eq!(
            parsed_object(Value::String(obj.to_string())).unwrap(),
            obj
        );
        for bad in [json!([1, 2]), json!("not json"), json!("[1]"), json!(42)] {
            assert_eq!(parsed_object(bad).unwrap_err().kind(), "invalid_request");
        }
    }

    #[tokio::test]
    async fn timeout_body_is_marked_retryable() {
        let response = AppError::StorageTimeout("document fetch".into()).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["success"], json!(false));
        assert_eq!(body["kind"], json!("storage_timeout"));
        assert_eq!(body["retryable"], json!(true));
        assert!(!body["detail"].as_str().unwrap().contains("document fetch"));

        let response = AppError::NotFound("Match result 9 not found".into()).into_response();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["retryable"], json!(false));
    }

    #[test]
    fn error_status_follows_kind() {
        let cases = [
            (AppError::InvalidMatchRequest("x".into()), StatusCode::BAD_REQUEST),
            (AppError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (
                AppError::Normalization {
                    document: "invoice 2".into(),
                    field: "total_amount".into(),
                    reason: "is missing".into(),
                },
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (AppError::StorageTimeout("x".into()), StatusCode::SERVICE_UNAVAILABLE),
            (AppError::Internal("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(err.into_response().status(), status);
        }
    }
}
