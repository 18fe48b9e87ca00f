use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 单据类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DocType {
    Po,
    Invoice,
    Delivery,
}

impl DocType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Po => "PO",
            Self::Invoice => "INVOICE",
            Self::Delivery => "DELIVERY",
        }
    }
}

impl fmt::Display for DocType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PO" => Ok(Self::Po),
            "INVOICE" => Ok(Self::Invoice),
            "DELIVERY" => Ok(Self::Delivery),
            other => Err(format!("Invalid document type '{other}', expected PO, INVOICE or DELIVERY")),
        }
    }
}

/// 单据解析状态: 上传即 PENDING_PARSE，外部解析回写后为 PARSED
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DocumentStatus {
    PendingParse,
    Parsed,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PendingParse => "PENDING_PARSE",
            Self::Parsed => "PARSED",
        }
    }
}

impl FromStr for DocumentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING_PARSE" => Ok(Self::PendingParse),
            "PARSED" => Ok(Self::Parsed),
            other => Err(format!("unknown document status '{other}'")),
        }
    }
}

/// 单据主表
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Document {
    pub id: i64,
    pub company_id: i64,
    pub doc_type: DocType,
    pub filename: String,
    pub status: DocumentStatus,
    pub ocr_text: Option<String>,
    pub parsed_json: Option<serde_json::Value>,
    pub uploaded_at: DateTime<Utc>,
}

impl Document {
    pub fn is_parsed(&self) -> bool {
        self.status == DocumentStatus::Parsed && self.parsed_json.is_some()
    }
}

/// 新建单据 (上传阶段)
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub company_id: i64,
    pub doc_type: DocType,
    pub filename: String,
}

/// 外部解析阶段回写的结果
#[derive(Debug, Clone)]
pub struct ParseOutput {
    pub parsed_json: serde_json::Value,
    pub ocr_text: Option<String>,
}
