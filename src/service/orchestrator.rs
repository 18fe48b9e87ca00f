use chrono::Utc;
use dashmap::DashMap;
use serde_json::{Map, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use super::aligner::LineItemAligner;
use super::evaluator::{detect_anomalies, DiscrepancyEvaluator};
use super::normalizer::Normalizer;
use super::report::ReportWriter;
use crate::config::MatchingConfig;
use crate::db::DocumentStore;
use crate::error::{AppError, AppResult};
use crate::models::{
    ComparisonScope, ComparisonStatus, DocType, Document, FieldComparison, MatchResult,
    OverallStatus,
};

/// 匹配请求 (已校验)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchRequest {
    pub company_id: i64,
    pub po_id: i64,
    pub invoice_id: i64,
}

impl MatchRequest {
    /// 从请求体解析；ID 缺失或非正整数均为 InvalidMatchRequest
    pub fn from_json(body: &Value) -> AppResult<Self> {
        let obj = body.as_object().ok_or_else(|| {
            AppError::InvalidMatchRequest("Request body must be a JSON object".to_string())
        })?;
        Ok(Self {
            company_id: id_field(obj, "company_id")?,
            po_id: id_field(obj, "po_id")?,
            invoice_id: id_field(obj, "invoice_id")?,
        })
    }
}

fn id_field(obj: &Map<String, Value>, name: &str) -> AppResult<i64> {
    match obj.get(name) {
        None | Some(Value::Null) => Err(AppError::InvalidMatchRequest(format!("{name} is required"))),
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| {
                n.as_f64()
                    .filter(|f| f.fract() == 0.0 && f.abs() < 9.0e15)
                    .map(|f| f as i64)
            })
            .filter(|id| *id > 0)
            .ok_or_else(|| AppError::InvalidMatchRequest(format!("{name} must be a positive integer"))),
        Some(_) => Err(AppError::InvalidMatchRequest(format!("{name} must be an integer"))),
    }
}

/// 纯计算部分: 规范化 -> 对齐 -> 评估 -> 汇总，不做任何 IO
pub struct Reconciler<'a> {
    config: &'a MatchingConfig,
}

impl<'a> Reconciler<'a> {
    pub fn new(config: &'a MatchingConfig) -> Self {
        Self { config }
    }

    /// 返回的结果尚未生成报告 (`report_path` 为空)
    pub fn reconcile(&self, req: &MatchRequest, po_raw: &Value, invoice_raw: &Value) -> AppResult<MatchResult> {
        let normalizer = Normalizer::new(self.config);
        let po = normalizer.normalize(po_raw, &format!("purchase order {}", req.po_id))?;
        let invoice = normalizer.normalize(invoice_raw, &format!("invoice {}", req.invoice_id))?;

        let mut pairs = LineItemAligner::new(self.config).align(&po.line_items, &invoice.line_items);
        let comparisons = DiscrepancyEvaluator::new(self.config).evaluate(&po, &invoice, &mut pairs);
        let (overall_status, confidence_score) = aggregate(&comparisons);

        Ok(MatchResult {
            id: None,
            company_id: req.company_id,
            po_document_id: req.po_id,
            invoice_document_id: req.invoice_id,
            overall_status,
            confidence_score,
            field_comparisons: comparisons,
            line_item_pairs: pairs,
            anomalies: detect_anomalies(&po, &invoice),
            report_path: String::new(),
            created_at: Utc::now(),
        })
    }
}

/// 汇总规则:
/// 全部为 MATCH/TOLERATED -> MATCHED；单据级金额字段出现 MISMATCH -> MISMATCHED；否则 PARTIAL。
/// 置信度 = (MATCH 数 + 0.5 × TOLERATED 数) / 比较总数
pub fn aggregate(comparisons: &[FieldComparison]) -> (OverallStatus, f64) {
    let all_ok = comparisons
        .iter()
        .all(|c| c.status != ComparisonStatus::Mismatch);
    let monetary_mismatch = comparisons.iter().any(|c| {
        c.scope == ComparisonScope::Document && c.monetary && c.status == ComparisonStatus::Mismatch
    });

    let status = if all_ok {
        OverallStatus::Matched
    } else if monetary_mismatch {
        OverallStatus::Mismatched
    } else {
        OverallStatus::Partial
    };

    if comparisons.is_empty() {
        return (status, 0.0);
    }
    let weight: f64 = comparisons
        .iter()
        .map(|c| match c.status {
            ComparisonStatus::Match => 1.0,
            ComparisonStatus::Tolerated => 0.5,
            ComparisonStatus::Mismatch => 0.0,
        })
        .sum();
    (status, weight / comparisons.len() as f64)
}

/// 匹配编排服务
///
/// 每次调用自包含，仅在最后一步写报告与结果；同一单据组合的提交按键串行。
#[derive(Clone)]
pub struct MatchService {
    store: Arc<dyn DocumentStore>,
    reports: ReportWriter,
    config: Arc<MatchingConfig>,
    timeout: Duration,
    commit_locks: Arc<DashMap<(i64, i64), Arc<Mutex<()>>>>,
}

impl MatchService {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        reports: ReportWriter,
        config: MatchingConfig,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            reports,
            config: Arc::new(config),
            timeout,
            commit_locks: Arc::new(DashMap::new()),
        }
    }

    pub fn reports(&self) -> &ReportWriter {
        &self.reports
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// RunMatch 入口
    pub async fn run_match(&self, req: MatchRequest) -> AppResult<MatchResult> {
        tracing::info!(
            "[Match] company {}: PO {} vs 发票 {} 开始匹配",
            req.company_id, req.po_id, req.invoice_id
        );
        let started = std::time::Instant::now();

        let (company, po_doc, inv_doc) = futures::try_join!(
            self.bounded("company fetch", self.store.get_company(req.company_id)),
            self.bounded("document fetch", self.store.get_document(req.po_id)),
            self.bounded("document fetch", self.store.get_document(req.invoice_id)),
        )?;

        if company.is_none() {
            return Err(AppError::InvalidMatchRequest(format!(
                "Company {} does not exist",
                req.company_id
            )));
        }
        let po_raw = check_document(&req, po_doc, req.po_id, DocType::Po)?;
        let inv_raw = check_document(&req, inv_doc, req.invoice_id, DocType::Invoice)?;

        let result = match Reconciler::new(&self.config).reconcile(&req, &po_raw, &inv_raw) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!("[Match] PO {} vs 发票 {} 失败: {}", req.po_id, req.invoice_id, e);
                return Err(e);
            }
        };

        tracing::info!(
            "[Match] PO {} vs 发票 {}: {} 项比较, {} 组明细, 结论 {}, 置信度 {:.3}",
            req.po_id,
            req.invoice_id,
            result.field_comparisons.len(),
            result.line_item_pairs.len(),
            result.overall_status.as_str(),
            result.confidence_score
        );

        // 提交在独立任务中执行: 请求被取消时要么尚未提交，要么提交完整完成
        let this = self.clone();
        let committed = tokio::spawn(async move { this.commit(result).await })
            .await
            .map_err(|e| AppError::Internal(e.to_string()))??;

        tracing::info!(
            "[Match] 匹配结果 {:?} 已保存, 报告 {}, 耗时: {:?}",
            committed.id,
            committed.report_path,
            started.elapsed()
        );
        Ok(committed)
    }

    pub async fn get_match(&self, match_id: i64) -> AppResult<MatchResult> {
        self.bounded("match fetch", self.store.get_match(match_id))
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Match result {match_id} not found")))
    }

    pub async fn latest_match(&self, po_id: i64, invoice_id: i64) -> AppResult<MatchResult> {
        self.bounded("match fetch", self.store.latest_match(po_id, invoice_id))
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!("No match result for PO {po_id} and invoice {invoice_id}"))
            })
    }

    async fn commit(&self, result: MatchResult) -> AppResult<MatchResult> {
        let key = (result.po_document_id, result.invoice_document_id);
        let lock = self.commit_locks.entry(key).or_default().clone();

        let outcome = {
            let _guard = lock.lock().await;
            self.write_and_persist(result).await
        };

        drop(lock);
        self.commit_locks.remove_if(&key, |_, l| Arc::strong_count(l) == 1);
        outcome
    }

    /// 预留报告名 -> 保存结果 (取得 ID) -> 写临时文件 -> 同步发布。
    /// 保存失败时只释放预留；报告写入或发布失败时撤销已保存的结果。
    async fn write_and_persist(&self, mut result: MatchResult) -> AppResult<MatchResult> {
        let slot = self.reports.reserve(&result)?;
        result.report_path = slot.report_path();

        let stored = self
            .bounded("match persist", self.store.insert_match(result))
            .await?;

        let staged = match self.bounded("report write", self.reports.stage(&slot, &stored)).await {
            Ok(staged) => staged,
            Err(e) => return Err(self.revoke(&stored, e).await),
        };
        if let Err(e) = staged.publish() {
            return Err(self.revoke(&stored, e).await);
        }
        Ok(stored)
    }

    async fn revoke(&self, stored: &MatchResult, cause: AppError) -> AppError {
        let Some(id) = stored.id else {
            return cause;
        };
        match self.bounded("match revoke", self.store.delete_match(id)).await {
            Ok(_) => tracing::warn!("[Match] 报告未能发布 ({}), 已撤销匹配结果 {}", cause, id),
            Err(e) => tracing::error!("✗ 撤销匹配结果 {} 失败: {}", id, e),
        }
        cause
    }

    async fn bounded<T>(&self, op: &str, fut: impl Future<Output = AppResult<T>>) -> AppResult<T> {
        with_timeout(self.timeout, op, fut).await
    }
}

/// 存储操作统一超时，超时转为可重试的 StorageTimeout
pub async fn with_timeout<T>(
    timeout: Duration,
    op: &str,
    fut: impl Future<Output = AppResult<T>>,
) -> AppResult<T> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(r) => r,
        Err(_) => {
            tracing::error!("✗ {} 超时 (>{:?})", op, timeout);
            Err(AppError::StorageTimeout(op.to_string()))
        }
    }
}

/// 前置条件: 存在、归属同一公司、类型正确、已解析
fn check_document(
    req: &MatchRequest,
    doc: Option<Document>,
    id: i64,
    expected: DocType,
) -> AppResult<Value> {
    let label = match expected {
        DocType::Po => "PO",
        _ => "Invoice",
    };
    let doc = doc.ok_or_else(|| {
        AppError::InvalidMatchRequest(format!("{label} document {id} not found"))
    })?;
    if doc.company_id != req.company_id {
        return Err(AppError::InvalidMatchRequest(format!(
            "Document {id} does not belong to company {}",
            req.company_id
        )));
    }
    if doc.doc_type != expected {
        return Err(AppError::InvalidMatchRequest(format!(
            "Document {id} is a {} document, expected {}",
            doc.doc_type, expected
        )));
    }
    if !doc.is_parsed() {
        return Err(AppError::InvalidMatchRequest(format!(
            "Document {id} has not been parsed yet"
        )));
    }
    doc.parsed_json.ok_or_else(|| {
        AppError::InvalidMatchRequest(format!("Document {id} has not been parsed yet"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_ids_must_be_positive_integers() {
        let ok = MatchRequest::from_json(&json!({"company_id": 1, "po_id": 2, "invoice_id": 3.0})).unwrap();
        assert_eq!(ok, MatchRequest { company_id: 1, po_id: 2, invoice_id: 3 });

        for body in [
            json!({"po_id": 2, "invoice_id": 3}),
            json!({"company_id": 1, "po_id": "2", "invoice_id": 3}),
            json!({"company_id": 1, "po_id": 2.5, "invoice_id": 3}),
            json!({"company_id": 1, "po_id": 2, "invoice_id": null}),
            json!({"company_id": 0, "po_id": 2, "invoice_id": 3}),
            json!([1, 2, 3]),
        ] {
            let err = MatchRequest::from_json(&body).unwrap_err();
            assert_eq!(err.kind(), "invalid_match_request", "{body}");
        }
    }

    #[test]
    fn aggregate_weights_tolerated_as_half() {
        let cmp = |status, monetary| FieldComparison {
            field_name: "f".into(),
            po_value: None,
            invoice_value: None,
            status,
            delta: None,
            scope: ComparisonScope::Document,
            monetary,
        };
        let (status, score) = aggregate(&[
            cmp(ComparisonStatus::Match, true),
            cmp(ComparisonStatus::Tolerated, true),
        ]);
        assert_eq!(status, OverallStatus::Matched);
        assert!((score - 0.75).abs() < 1e-9);

        let (status, _) = aggregate(&[
            cmp(ComparisonStatus::Match, true),
            cmp(ComparisonStatus::Mismatch, false),
        ]);
        assert_eq!(status, OverallStatus::Partial);

        let (status, score) = aggregate(&[cmp(ComparisonStatus::Mismatch, true)]);
        assert_eq!(status, OverallStatus::Mismatched);
        assert_eq!(score, 0.0);
    }
}
