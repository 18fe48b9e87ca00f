use bigdecimal::BigDecimal;
use chrono::NaiveDate;
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};

/// 规范化后的明细行
///
/// 数量、单价、金额均为定点十进制；无法解析的字段记为 None 并登记在 `unparsed`。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sku: Option<String>,
    pub quantity: Option<BigDecimal>,
    pub unit_price: Option<BigDecimal>,
    pub line_total: Option<BigDecimal>,
    #[serde(default, skip_serializing_if = "IndexSet::is_empty")]
    pub unparsed: IndexSet<String>,
}

impl LineItem {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            sku: None,
            quantity: None,
            unit_price: None,
            line_total: None,
            unparsed: IndexSet::new(),
        }
    }

    pub fn is_unparsed(&self, field: &str) -> bool {
        self.unparsed.contains(field)
    }
}

/// 规范化后的单据 (仅存在于内存)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedDocument {
    pub document_number: String,
    pub document_date: Option<NaiveDate>,
    pub currency: Option<String>,
    pub total_amount: BigDecimal,
    pub tax_amount: Option<BigDecimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vendor_name: Option<String>,
    /// 发票上引用的采购订单号
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub po_reference: Option<String>,
    pub line_items: Vec<LineItem>,
    /// 存在但无法解析的单据级字段
    #[serde(default, skip_serializing_if = "IndexSet::is_empty")]
    pub unparsed: IndexSet<String>,
}

impl ParsedDocument {
    pub fn is_unparsed(&self, field: &str) -> bool {
        self.unparsed.contains(field)
    }
}
