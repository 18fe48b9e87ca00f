use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::atomic::{AtomicI64, Ordering};

use super::store::DocumentStore;
use crate::error::AppResult;
use crate::models::{
    Company, ContactUpdate, Document, DocumentStatus, MatchResult, NewCompany, NewDocument,
    ParseOutput,
};

/// 内存存储 (本地运行与测试)
#[derive(Debug, Default)]
pub struct MemoryStore {
    companies: DashMap<i64, Company>,
    documents: DashMap<i64, Document>,
    matches: DashMap<i64, MatchResult>,
    next_company_id: AtomicI64,
    next_document_id: AtomicI64,
    next_match_id: AtomicI64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(counter: &AtomicI64) -> i64 {
        counter.fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn create_company(&self, company: NewCompany) -> AppResult<Company> {
        let id = Self::next_id(&self.next_company_id);
        let company = Company {
            id,
            name: company.name,
            contact_person: company.contact_person,
            email: company.email,
            created_at: Utc::now(),
        };
        self.companies.insert(id, company.clone());
        Ok(company)
    }

    async fn get_company(&self, company_id: i64) -> AppResult<Option<Company>> {
        Ok(self.companies.get(&company_id).map(|c| c.clone()))
    }

    async fn list_companies(&self) -> AppResult<Vec<Company>> {
        let mut companies: Vec<Company> = self.companies.iter().map(|c| c.clone()).collect();
        companies.sort_by_key(|c| c.id);
        Ok(companies)
    }

    async fn update_company_contact(
        &self,
        company_id: i64,
        update: ContactUpdate,
    ) -> AppResult<Option<Company>> {
        Ok(self.companies.get_mut(&company_id).map(|mut c| {
            c.apply_contact(&update);
            c.clone()
        }))
    }

    async fn create_document(&self, document: NewDocument) -> AppResult<Document> {
        let id = Self::next_id(&self.next_document_id);
        let document = Document {
            id,
            company_id: document.company_id,
            doc_type: document.doc_type,
            filename: document.filename,
            status: DocumentStatus::PendingParse,
            ocr_text: None,
            parsed_json: None,
            uploaded_at: Utc::now(),
        };
        self.documents.insert(id, document.clone());
        Ok(document)
    }

    async fn get_document(&self, document_id: i64) -> AppResult<Option<Document>> {
        Ok(self.documents.get(&document_id).map(|d| d.clone()))
    }

    async fn list_documents(&self, company_id: i64) -> AppResult<Vec<Document>> {
        let mut docs: Vec<Document> = self
            .documents
            .iter()
            .filter(|d| d.company_id == company_id)
            .map(|d| d.clone())
            .collect();
        docs.sort_by(|a, b| b.uploaded_at.cmp(&a.uploaded_at).then(b.id.cmp(&a.id)));
        Ok(docs)
    }

    async fn attach_parse_output(
        &self,
        document_id: i64,
        output: ParseOutput,
    ) -> AppResult<Option<Document>> {
        Ok(self.documents.get_mut(&document_id).map(|mut d| {
            d.parsed_json = Some(output.parsed_json);
            if output.ocr_text.is_some() {
                d.ocr_text = output.ocr_text;
            }
            d.status = DocumentStatus::Parsed;
            d.clone()
        }))
    }

    async fn insert_match(&self, mut result: MatchResult) -> AppResult<MatchResult> {
        let id = Self::next_id(&self.next_match_id);
        result.id = Some(id);
        self.matches.insert(id, result.clone());
        Ok(result)
    }

    async fn get_match(&self, match_id: i64) -> AppResult<Option<MatchResult>> {
        Ok(self.matches.get(&match_id).map(|m| m.clone()))
    }

    async fn delete_match(&self, match_id: i64) -> AppResult<bool> {
        Ok(self.matches.remove(&match_id).is_some())
    }

    async fn latest_match(
        &self,
        po_document_id: i64,
        invoice_document_id: i64,
    ) -> AppResult<Option<MatchResult>> {
        Ok(self
            .matches
            .iter()
            .filter(|m| {
                m.po_document_id == po_document_id && m.invoice_document_id == invoice_document_id
            })
            .max_by_key(|m| m.id)
            .map(|m| m.clone()))
    }
}
