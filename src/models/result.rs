use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::canonical::LineItem;

/// 单项比较结论
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ComparisonStatus {
    Match,
    Tolerated,
    Mismatch,
}

impl ComparisonStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Match => "MATCH",
            Self::Tolerated => "TOLERATED",
            Self::Mismatch => "MISMATCH",
        }
    }

    /// 取两者中更差的结论
    pub fn worst(self, other: Self) -> Self {
        if self.rank() >= other.rank() {
            self
        } else {
            other
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Match => 0,
            Self::Tolerated => 1,
            Self::Mismatch => 2,
        }
    }
}

/// 整体匹配结论
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OverallStatus {
    Matched,
    Partial,
    Mismatched,
}

impl OverallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Matched => "MATCHED",
            Self::Partial => "PARTIAL",
            Self::Mismatched => "MISMATCHED",
        }
    }
}

/// 比较项所在层级
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonScope {
    Document,
    LineItem,
}

/// 字段比较结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldComparison {
    pub field_name: String,
    pub po_value: Option<String>,
    pub invoice_value: Option<String>,
    pub status: ComparisonStatus,
    /// 数值为绝对差，日期为相差天数；文本比较为 None
    pub delta: Option<BigDecimal>,
    pub scope: ComparisonScope,
    pub monetary: bool,
}

/// 明细配对: 任一侧可为空 (未匹配)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchPair {
    pub po_index: Option<usize>,
    pub invoice_index: Option<usize>,
    pub po_item: Option<LineItem>,
    pub invoice_item: Option<LineItem>,
    pub similarity: f64,
    pub status: ComparisonStatus,
}

impl MatchPair {
    pub fn is_matched(&self) -> bool {
        self.po_item.is_some() && self.invoice_item.is_some()
    }
}

/// 匹配结果 - 每次调用生成一次，生成后不可变
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    /// 持久化后分配
    pub id: Option<i64>,
    pub company_id: i64,
    pub po_document_id: i64,
    pub invoice_document_id: i64,
    pub overall_status: OverallStatus,
    pub confidence_score: f64,
    pub field_comparisons: Vec<FieldComparison>,
    pub line_item_pairs: Vec<MatchPair>,
    #[serde(default)]
    pub anomalies: Vec<String>,
    pub report_path: String,
    pub created_at: DateTime<Utc>,
}
