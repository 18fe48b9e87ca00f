use async_trait::async_trait;
use bigdecimal::BigDecimal;
use std::sync::Arc;
use std::time::Duration;

use invoice_match_rust::config::MatchingConfig;
use invoice_match_rust::models::{
    Company, ComparisonScope, ComparisonStatus, ContactUpdate, DocType, Document, MatchResult,
    NewCompany, NewDocument, OverallStatus, ParseOutput,
};
use invoice_match_rust::{
    AppError, AppResult, DocumentStore, MatchRequest, MatchService, MemoryStore, ReportWriter,
};
use serde_json::{json, Value};
use tempfile::TempDir;

struct Fixture {
    store: Arc<MemoryStore>,
    service: MatchService,
    company_id: i64,
    _reports: TempDir,
}

async fn fixture() -> Fixture {
    let reports = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());
    let company = store
        .create_company(NewCompany {
            name: "Acme Trading".into(),
            contact_person: None,
            email: None,
        })
        .await
        .unwrap();
    let service = MatchService::new(
        store.clone(),
        ReportWriter::new(reports.path()),
        MatchingConfig::default(),
        Duration::from_secs(5),
    );
    Fixture {
        store,
        service,
        company_id: company.id,
        _reports: reports,
    }
}

impl Fixture {
    async fn document(&self, company_id: i64, doc_type: DocType, parsed: Option<Value>) -> i64 {
        let doc = self
            .store
            .create_document(NewDocument {
                company_id,
                doc_type,
                filename: format!("{}.pdf", doc_type.as_str().to_lowercase()),
            })
            .await
            .unwrap();
        if let Some(parsed_json) = parsed {
            self.store
                .attach_parse_output(
                    doc.id,
                    ParseOutput {
                        parsed_json,
                        ocr_text: None,
                    },
                )
                .await
                .unwrap();
        }
        doc.id
    }

    async fn pair(&self, po: Value, invoice: Value) -> MatchRequest {
        let po_id = self.document(self.company_id, DocType::Po, Some(po)).await;
        let invoice_id = self
            .document(self.company_id, DocType::Invoice, Some(invoice))
            .await;
        MatchRequest {
            company_id: self.company_id,
            po_id,
            invoice_id,
        }
    }
}

fn doc(number: &str, total: &str, items: Value) -> Value {
    json!({
        "document_number": number,
        "document_date": "2024-03-01",
        "currency": "USD",
        "total_amount": total,
        "tax_amount": "0.00",
        "line_items": items,
    })
}

fn single_item(total: &str) -> Value {
    json!([{ "description": "Industrial pump", "quantity": "1", "unit_price": total, "line_total": total }])
}

#[tokio::test]
async fn identical_documents_match_fully() {
    let fx = fixture().await;
    let body = doc("PO-100", "1000.00", single_item("1000.00"));
    let req = fx.pair(body.clone(), body).await;

    let result = fx.service.run_match(req).await.unwrap();
    assert_eq!(result.overall_status, OverallStatus::Matched);
    assert_eq!(result.confidence_score, 1.0);
    assert!(result
        .field_comparisons
        .iter()
        .all(|c| c.status == ComparisonStatus::Match));
    assert!(result.id.is_some());
    assert!(result.report_path.starts_with("reports/"));
}

#[tokio::test]
async fn small_total_difference_is_tolerated() {
    let fx = fixture().await;
    let req = fx
        .pair(
            doc("PO-101", "1000.00", single_item("1000.00")),
            doc("INV-9", "1005.00", single_item("1000.00")),
        )
        .await;

    let result = fx.service.run_match(req).await.unwrap();
    let total = result
        .field_comparisons
        .iter()
        .find(|c| c.field_name == "total_amount")
        .unwrap();
    assert_eq!(total.status, ComparisonStatus::Tolerated);
    assert_eq!(total.delta.clone().unwrap(), BigDecimal::from(5));
    assert_eq!(result.overall_status, OverallStatus::Matched);
    assert!(result.confidence_score < 1.0);
}

#[tokio::test]
async fn large_total_difference_is_mismatched() {
    let fx = fixture().await;
    let req = fx
        .pair(
            doc("PO-102", "1000.00", single_item("1000.00")),
            doc("INV-10", "1200.00", single_item("1000.00")),
        )
        .await;

    let result = fx.service.run_match(req).await.unwrap();
    let total = result
        .field_comparisons
        .iter()
        .find(|c| c.field_name == "total_amount")
        .unwrap();
    assert_eq!(total.status, ComparisonStatus::Mismatch);
    assert_eq!(result.overall_status, OverallStatus::Mismatched);
}

#[tokio::test]
async fn extra_and_missing_items_make_partial_match() {
    let fx = fixture().await;
    let po = doc(
        "PO-103",
        "700.00",
        json!([
            { "description": "Steel bolts M8", "quantity": "500", "unit_price": "0.20", "line_total": "100.00" },
            { "description": "Office chair", "quantity": "4", "unit_price": "120.00", "line_total": "480.00" },
            { "description": "Printer paper A4", "quantity": "20", "unit_price": "6.00", "line_total": "120.00" },
        ]),
    );
    let invoice = doc(
        "INV-11",
        "700.00",
        json!([
            { "description": "Office chair", "quantity": "4", "unit_price": "120.00", "line_total": "480.00" },
            { "description": "Printer paper A4", "quantity": "20", "unit_price": "6.00", "line_total": "120.00" },
            { "description": "Consulting services", "quantity": "1", "unit_price": "100.00", "line_total": "100.00" },
        ]),
    );
    let req = fx.pair(po, invoice).await;

    let result = fx.service.run_match(req).await.unwrap();
    let matched: Vec<_> = result.line_item_pairs.iter().filter(|p| p.is_matched()).collect();
    assert_eq!(matched.len(), 2);
    let unmatched: Vec<_> = result.line_item_pairs.iter().filter(|p| !p.is_matched()).collect();
    assert_eq!(unmatched.len(), 2);
    assert!(unmatched.iter().all(|p| p.status == ComparisonStatus::Mismatch));
    assert!(unmatched.iter().any(|p| p.po_index == Some(0)));
    assert!(unmatched.iter().any(|p| p.invoice_index == Some(2)));

    let item_mismatches = result
        .field_comparisons
        .iter()
        .filter(|c| c.scope == ComparisonScope::LineItem && c.status == ComparisonStatus::Mismatch)
        .count();
    assert_eq!(item_mismatches, 4);
    assert_eq!(result.overall_status, OverallStatus::Partial);
}

#[tokio::test]
async fn po_id_pointing_at_invoice_is_rejected() {
    let fx = fixture().await;
    let body = doc("INV-12", "10.00", single_item("10.00"));
    let first = fx.document(fx.company_id, DocType::Invoice, Some(body.clone())).await;
    let second = fx.document(fx.company_id, DocType::Invoice, Some(body)).await;

    let err = fx
        .service
        .run_match(MatchRequest {
            company_id: fx.company_id,
            po_id: first,
            invoice_id: second,
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "invalid_match_request");
    assert!(err.detail().contains("expected PO"));
}

#[tokio::test]
async fn documents_of_another_company_are_rejected() {
    let fx = fixture().await;
    let other = fx
        .store
        .create_company(NewCompany {
            name: "Other Corp".into(),
            contact_person: None,
            email: None,
        })
        .await
        .unwrap();
    let body = doc("PO-1", "10.00", single_item("10.00"));
    let po_id = fx.document(other.id, DocType::Po, Some(body.clone())).await;
    let invoice_id = fx.document(fx.company_id, DocType::Invoice, Some(body)).await;

    let err = fx
        .service
        .run_match(MatchRequest {
            company_id: fx.company_id,
            po_id,
            invoice_id,
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "invalid_match_request");
}

#[tokio::test]
async fn unknown_company_and_unparsed_document_are_rejected() {
    let fx = fixture().await;
    let body = doc("PO-1", "10.00", single_item("10.00"));
    let po_id = fx.document(fx.company_id, DocType::Po, Some(body)).await;
    let pending = fx.document(fx.company_id, DocType::Invoice, None).await;

    let err = fx
        .service
        .run_match(MatchRequest {
            company_id: fx.company_id,
            po_id,
            invoice_id: pending,
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "invalid_match_request");
    assert!(err.detail().contains("not been parsed"));

    let err = fx
        .service
        .run_match(MatchRequest {
            company_id: 999,
            po_id,
            invoice_id: pending,
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "invalid_match_request");
}

#[tokio::test]
async fn unreadable_total_fails_normalization_without_report() {
    let fx = fixture().await;
    let mut invoice = doc("INV-13", "10.00", single_item("10.00"));
    invoice["total_amount"] = json!("ten dollars");
    let req = fx.pair(doc("PO-2", "10.00", single_item("10.00")), invoice).await;

    let err = fx.service.run_match(req).await.unwrap_err();
    assert_eq!(err.kind(), "normalization_error");
    assert!(err.detail().contains("total_amount"));

    let written = std::fs::read_dir(fx.service.reports().dir())
        .map(|entries| entries.count())
        .unwrap_or(0);
    assert_eq!(written, 0);
    assert!(fx
        .service
        .latest_match(req.po_id, req.invoice_id)
        .await
        .is_err());
}

#[tokio::test]
async fn rerun_keeps_previous_report_and_latest_wins() {
    let fx = fixture().await;
    let body = doc("PO-104", "250.00", single_item("250.00"));
    let req = fx.pair(body.clone(), body).await;

    let first = fx.service.run_match(req).await.unwrap();
    let second = fx.service.run_match(req).await.unwrap();
    assert_ne!(first.report_path, second.report_path);
    assert_ne!(first.id, second.id);

    for r in [&first, &second] {
        let name = r.report_path.trim_start_matches("reports/");
        assert!(fx.service.reports().dir().join(name).exists());
    }

    let latest = fx.service.latest_match(req.po_id, req.invoice_id).await.unwrap();
    assert_eq!(latest.id, second.id);
    let stored = fx.service.get_match(first.id.unwrap()).await.unwrap();
    assert_eq!(stored.report_path, first.report_path);
}

#[tokio::test]
async fn concurrent_runs_for_same_pair_each_get_a_report() {
    let fx = fixture().await;
    let body = doc("PO-105", "80.00", single_item("80.00"));
    let req = fx.pair(body.clone(), body).await;

    let (a, b) = tokio::join!(fx.service.run_match(req), fx.service.run_match(req));
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_ne!(a.report_path, b.report_path);
}

#[tokio::test]
async fn invoice_dated_before_po_is_flagged_but_not_failed() {
    let fx = fixture().await;
    let po = doc("PO-106", "50.00", single_item("50.00"));
    let mut invoice = po.clone();
    invoice["document_date"] = json!("2024-02-27");
    let req = fx.pair(po, invoice).await;

    let result = fx.service.run_match(req).await.unwrap();
    assert_eq!(result.anomalies, vec!["invoice_date_before_po_date".to_string()]);
    assert_eq!(result.overall_status, OverallStatus::Matched);
}

/// 可注入延迟与失败的存储
#[derive(Default)]
struct FlakyStore {
    inner: MemoryStore,
    fetch_delay: Duration,
    insert_delay: Duration,
    fail_insert: bool,
}

#[async_trait]
impl DocumentStore for FlakyStore {
    async fn create_company(&self, company: NewCompany) -> AppResult<Company> {
        self.inner.create_company(company).await
    }

    async fn get_company(&self, company_id: i64) -> AppResult<Option<Company>> {
        self.inner.get_company(company_id).await
    }

    async fn list_companies(&self) -> AppResult<Vec<Company>> {
        self.inner.list_companies().await
    }

    async fn update_company_contact(
        &self,
        company_id: i64,
        update: ContactUpdate,
    ) -> AppResult<Option<Company>> {
        self.inner.update_company_contact(company_id, update).await
    }

    async fn create_document(&self, document: NewDocument) -> AppResult<Document> {
        self.inner.create_document(document).await
    }

    async fn get_document(&self, document_id: i64) -> AppResult<Option<Document>> {
        tokio::time::sleep(self.fetch_delay).await;
        self.inner.get_document(document_id).await
    }

    async fn list_documents(&self, company_id: i64) -> AppResult<Vec<Document>> {
        self.inner.list_documents(company_id).await
    }

    async fn attach_parse_output(
        &self,
        document_id: i64,
        output: ParseOutput,
    ) -> AppResult<Option<Document>> {
        self.inner.attach_parse_output(document_id, output).await
    }

    async fn insert_match(&self, result: MatchResult) -> AppResult<MatchResult> {
        tokio::time::sleep(self.insert_delay).await;
        if self.fail_insert {
            return Err(AppError::Storage("disk full".into()));
        }
        self.inner.insert_match(result).await
    }

    async fn get_match(&self, match_id: i64) -> AppResult<Option<MatchResult>> {
        self.inner.get_match(match_id).await
    }

    async fn delete_match(&self, match_id: i64) -> AppResult<bool> {
        self.inner.delete_match(match_id).await
    }

    async fn latest_match(
        &self,
        po_document_id: i64,
        invoice_document_id: i64,
    ) -> AppResult<Option<MatchResult>> {
        self.inner.latest_match(po_document_id, invoice_document_id).await
    }
}

async fn flaky_setup(store: FlakyStore, timeout: Duration) -> (MatchService, MatchRequest, TempDir) {
    let reports = tempfile::tempdir().unwrap();
    let company = store
        .create_company(NewCompany {
            name: "Acme Trading".into(),
            contact_person: None,
            email: None,
        })
        .await
        .unwrap();
    let body = doc("PO-200", "320.00", single_item("320.00"));
    let mut ids = Vec::new();
    for doc_type in [DocType::Po, DocType::Invoice] {
        let d = store
            .create_document(NewDocument {
                company_id: company.id,
                doc_type,
                filename: "scan.pdf".into(),
            })
            .await
            .unwrap();
        store
            .attach_parse_output(
                d.id,
                ParseOutput {
                    parsed_json: body.clone(),
                    ocr_text: None,
                },
            )
            .await
            .unwrap();
        ids.push(d.id);
    }
    let service = MatchService::new(
        Arc::new(store),
        ReportWriter::new(reports.path()),
        MatchingConfig::default(),
        timeout,
    );
    let req = MatchRequest {
        company_id: company.id,
        po_id: ids[0],
        invoice_id: ids[1],
    };
    (service, req, reports)
}

fn report_dir_entries(service: &MatchService) -> usize {
    std::fs::read_dir(service.reports().dir())
        .map(|entries| entries.count())
        .unwrap_or(0)
}

#[tokio::test]
async fn slow_document_fetch_is_retryable_timeout() {
    let store = FlakyStore {
        fetch_delay: Duration::from_millis(500),
        ..Default::default()
    };
    let (service, req, _dir) = flaky_setup(store, Duration::from_millis(20)).await;

    let err = service.run_match(req).await.unwrap_err();
    assert_eq!(err.kind(), "storage_timeout");
    assert!(err.is_retryable());
    assert_eq!(report_dir_entries(&service), 0);
}

#[tokio::test]
async fn slow_persist_times_out_without_report() {
    let store = FlakyStore {
        insert_delay: Duration::from_millis(500),
        ..Default::default()
    };
    let (service, req, _dir) = flaky_setup(store, Duration::from_millis(50)).await;

    let err = service.run_match(req).await.unwrap_err();
    assert_eq!(err.kind(), "storage_timeout");
    assert_eq!(report_dir_entries(&service), 0);
    assert_eq!(
        service.latest_match(req.po_id, req.invoice_id).await.unwrap_err().kind(),
        "not_found"
    );
}

#[tokio::test]
async fn failed_persist_leaves_no_report() {
    let store = FlakyStore {
        fail_insert: true,
        ..Default::default()
    };
    let (service, req, _dir) = flaky_setup(store, Duration::from_secs(5)).await;

    let err = service.run_match(req).await.unwrap_err();
    assert_eq!(err.kind(), "storage");
    assert_eq!(report_dir_entries(&service), 0);
}

#[tokio::test]
async fn published_report_carries_persisted_id() {
    let (service, req, _dir) = flaky_setup(FlakyStore::default(), Duration::from_secs(5)).await;

    let result = service.run_match(req).await.unwrap();
    let name = result.report_path.trim_start_matches("reports/");
    let report: MatchResult =
        serde_json::from_slice(&service.reports().read(name).await.unwrap()).unwrap();
    assert_eq!(report.id, result.id);
    assert!(report.id.is_some());
    assert_eq!(report_dir_entries(&service), 2);
}
