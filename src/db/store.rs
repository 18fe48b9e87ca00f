use async_trait::async_trait;

use crate::error::AppResult;
use crate::models::{
    Company, ContactUpdate, Document, MatchResult, NewCompany, NewDocument, ParseOutput,
};

/// 单据存储边界
///
/// 引擎只通过该接口读写公司、单据与匹配结果；实现方自行负责并发同步。
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn create_company(&self, company: NewCompany) -> AppResult<Company>;

    async fn get_company(&self, company_id: i64) -> AppResult<Option<Company>>;

    async fn list_companies(&self) -> AppResult<Vec<Company>>;

    /// 仅联系人字段可变
    async fn update_company_contact(
        &self,
        company_id: i64,
        update: ContactUpdate,
    ) -> AppResult<Option<Company>>;

    /// 新单据处于 PENDING_PARSE 状态
    async fn create_document(&self, document: NewDocument) -> AppResult<Document>;

    async fn get_document(&self, document_id: i64) -> AppResult<Option<Document>>;

    /// 按上传时间倒序
    async fn list_documents(&self, company_id: i64) -> AppResult<Vec<Document>>;

    /// 外部解析结果回写，状态转为 PARSED
    async fn attach_parse_output(
        &self,
        document_id: i64,
        output: ParseOutput,
    ) -> AppResult<Option<Document>>;

    /// 保存匹配结果并分配 ID
    async fn insert_match(&self, result: MatchResult) -> AppResult<MatchResult>;

    async fn get_match(&self, match_id: i64) -> AppResult<Option<MatchResult>>;

    /// 撤销一条匹配结果 (报告未能发布时)；返回是否存在
    async fn delete_match(&self, match_id: i64) -> AppResult<bool>;

    /// 某一 (PO, 发票) 组合最近一次的匹配结果
    async fn latest_match(
        &self,
        po_document_id: i64,
        invoice_document_id: i64,
    ) -> AppResult<Option<MatchResult>>;
}
