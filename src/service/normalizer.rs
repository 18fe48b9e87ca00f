use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate};
use indexmap::IndexSet;
use serde_json::{Map, Value};
use std::str::FromStr;

use crate::config::MatchingConfig;
use crate::error::{AppError, AppResult};
use crate::models::{LineItem, ParsedDocument};

// 原始字段别名 (首个非空者生效)
const DOCUMENT_NUMBER_KEYS: &[&str] = &["document_number", "doc_number", "number"];
const DOCUMENT_DATE_KEYS: &[&str] = &["document_date", "date"];
const CURRENCY_KEYS: &[&str] = &["currency", "currency_code"];
const TOTAL_KEYS: &[&str] = &["total_amount", "grand_total", "total"];
const TAX_KEYS: &[&str] = &["tax_amount", "tax", "tax_total"];
const VENDOR_KEYS: &[&str] = &["vendor_name", "vendor", "supplier"];
const PO_REFERENCE_KEYS: &[&str] = &["po_reference", "po_number", "purchase_order"];
const LINE_ITEM_KEYS: &[&str] = &["line_items", "items"];

const DESCRIPTION_KEYS: &[&str] = &["description", "name", "item"];
const SKU_KEYS: &[&str] = &["sku", "product_code", "code", "item_code"];
const QUANTITY_KEYS: &[&str] = &["quantity", "qty"];
const UNIT_PRICE_KEYS: &[&str] = &["unit_price", "rate", "price"];
const LINE_TOTAL_KEYS: &[&str] = &["line_total", "amount", "total"];

const CURRENCY_SYMBOLS: &[(char, &str)] = &[
    ('$', "USD"),
    ('€', "EUR"),
    ('£', "GBP"),
    ('¥', "JPY"),
    ('₹', "INR"),
];

/// 数值字段解析结果
#[derive(Debug, Clone, PartialEq)]
enum Parsed<T> {
    Absent,
    Value(T),
    Unparsable,
}

impl<T> Parsed<T> {
    fn into_option(self) -> Option<T> {
        match self {
            Parsed::Value(v) => Some(v),
            _ => None,
        }
    }
}

/// 字段规范化器: 原始解析字段 -> 规范化单据
pub struct Normalizer<'a> {
    date_formats: &'a [String],
}

impl<'a> Normalizer<'a> {
    pub fn new(config: &'a MatchingConfig) -> Self {
        Self {
            date_formats: &config.date_formats,
        }
    }

    /// `label` 用于错误信息，如 "purchase order 12"
    pub fn normalize(&self, raw: &Value, label: &str) -> AppResult<ParsedDocument> {
        let obj = raw.as_object().ok_or_else(|| AppError::Normalization {
            document: label.to_string(),
            field: "parsed_json".to_string(),
            reason: "is not a JSON object".to_string(),
        })?;

        let mut unparsed = carried_unparsed(obj);

        let document_number = match pick(obj, DOCUMENT_NUMBER_KEYS).and_then(text_of) {
            Some(n) => n,
            None => {
                return Err(AppError::Normalization {
                    document: label.to_string(),
                    field: "document_number".to_string(),
                    reason: "is missing or empty".to_string(),
                })
            }
        };

        let total_raw = pick(obj, TOTAL_KEYS);
        let total_amount = match total_raw.map(parse_decimal) {
            Some(Parsed::Value(v)) => v,
            Some(Parsed::Unparsable) => {
                return Err(AppError::Normalization {
                    document: label.to_string(),
                    field: "total_amount".to_string(),
                    reason: "is not a valid amount".to_string(),
                })
            }
            _ => {
                return Err(AppError::Normalization {
                    document: label.to_string(),
                    field: "total_amount".to_string(),
                    reason: "is missing".to_string(),
                })
            }
        };

        let tax_amount = record(&mut unparsed, "tax_amount", pick(obj, TAX_KEYS).map(parse_decimal));
        let document_date = record(
            &mut unparsed,
            "document_date",
            pick(obj, DOCUMENT_DATE_KEYS).map(|v| self.parse_date(v)),
        );

        let currency = match pick(obj, CURRENCY_KEYS) {
            Some(v) => record(&mut unparsed, "currency", Some(parse_currency(v))),
            None => total_raw.and_then(infer_currency),
        };

        let line_items = match pick(obj, LINE_ITEM_KEYS) {
            Some(Value::Array(items)) => items
                .iter()
                .enumerate()
                .filter_map(|(idx, item)| match item.as_object() {
                    Some(item) => Some(normalize_item(item)),
                    None => {
                        unparsed.insert(format!("line_items[{idx}]"));
                        None
                    }
                })
                .collect(),
            Some(_) => {
                unparsed.insert("line_items".to_string());
                Vec::new()
            }
            None => Vec::new(),
        };

        if !unparsed.is_empty() {
            tracing::debug!("[Normalize] {}: 无法解析的字段 {:?}", label, unparsed);
        }

        Ok(ParsedDocument {
            document_number,
            document_date,
            currency,
            total_amount,
            tax_amount,
            vendor_name: pick(obj, VENDOR_KEYS).and_then(text_of),
            po_reference: pick(obj, PO_REFERENCE_KEYS).and_then(text_of),
            line_items,
            unparsed,
        })
    }

    fn parse_date(&self, value: &Value) -> Parsed<NaiveDate> {
        let Some(s) = value.as_str().map(str::trim) else {
            return Parsed::Unparsable;
        };
        if s.is_empty() {
            return Parsed::Absent;
        }
        for fmt in self.date_formats {
            if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
                return Parsed::Value(d);
            }
        }
        match DateTime::parse_from_rfc3339(s) {
            Ok(dt) => Parsed::Value(dt.date_naive()),
            Err(_) => Parsed::Unparsable,
        }
    }
}

fn normalize_item(obj: &Map<String, Value>) -> LineItem {
    let mut item = LineItem::new(pick(obj, DESCRIPTION_KEYS).and_then(text_of).unwrap_or_default());
    item.unparsed = carried_unparsed(obj);
    item.sku = pick(obj, SKU_KEYS).and_then(text_of);
    item.quantity = record(&mut item.unparsed, "quantity", pick(obj, QUANTITY_KEYS).map(parse_decimal));
    item.unit_price = record(
        &mut item.unparsed,
        "unit_price",
        pick(obj, UNIT_PRICE_KEYS).map(parse_decimal),
    );
    item.line_total = record(
        &mut item.unparsed,
        "line_total",
        pick(obj, LINE_TOTAL_KEYS).map(parse_decimal),
    );

    if item.line_total.is_none() && !item.is_unparsed("line_total") {
        if let (Some(q), Some(p)) = (&item.quantity, &item.unit_price) {
            item.line_total = Some(q * p);
        }
    }
    item
}

/// 解析结果落地: 无法解析则登记字段名
fn record<T>(unparsed: &mut IndexSet<String>, field: &str, parsed: Option<Parsed<T>>) -> Option<T> {
    match parsed {
        Some(Parsed::Unparsable) => {
            unparsed.insert(field.to_string());
            None
        }
        Some(p) => p.into_option(),
        None => None,
    }
}

/// 已规范化单据再次规范化时保留原有的未解析标记
fn carried_unparsed(obj: &Map<String, Value>) -> IndexSet<String> {
    obj.get("unparsed")
        .and_then(Value::as_array)
        .map(|arr| arr.iter().filter_map(Value::as_str).map(str::to_string).collect())
        .unwrap_or_default()
}

fn pick<'v>(obj: &'v Map<String, Value>, keys: &[&str]) -> Option<&'v Value> {
    keys.iter()
        .filter_map(|k| obj.get(*k))
        .find(|v| !v.is_null())
}

fn text_of(value: &Value) -> Option<String> {
    let s = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    (!s.is_empty()).then_some(s)
}

/// 金额/数量解析: 去除货币符号、货币代码与千分位
fn parse_decimal(value: &Value) -> Parsed<BigDecimal> {
    match value {
        Value::Number(n) => match BigDecimal::from_str(&n.to_string()) {
            Ok(d) => Parsed::Value(d),
            Err(_) => Parsed::Unparsable,
        },
        Value::String(s) => parse_decimal_str(s),
        _ => Parsed::Unparsable,
    }
}

fn parse_decimal_str(input: &str) -> Parsed<BigDecimal> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Parsed::Absent;
    }

    let (negative, body) = match trimmed.strip_prefix('(').and_then(|s| s.strip_suffix(')')) {
        Some(inner) => (true, inner),
        None => (false, trimmed),
    };

    let mut cleaned: String = body
        .chars()
        .filter(|c| !c.is_whitespace() && !matches!(c, '\'' | '_'))
        .filter(|c| !CURRENCY_SYMBOLS.iter().any(|(sym, _)| sym == c))
        .collect();

    // 货币代码前后缀，如 "USD 1,000.00" / "1000 EUR"
    let code_len = cleaned.chars().take_while(|c| c.is_ascii_alphabetic()).count();
    if code_len == 3 {
        cleaned.drain(..3);
    }
    let tail_len = cleaned.chars().rev().take_while(|c| c.is_ascii_alphabetic()).count();
    if tail_len == 3 {
        cleaned.truncate(cleaned.len() - 3);
    }

    let Some(canonical) = strip_grouping(&cleaned) else {
        return Parsed::Unparsable;
    };
    if canonical.is_empty() || canonical.chars().any(|c| c.is_ascii_alphabetic()) {
        return Parsed::Unparsable;
    }

    match BigDecimal::from_str(&canonical) {
        Ok(d) if negative => Parsed::Value(-d),
        Ok(d) => Parsed::Value(d),
        Err(_) => Parsed::Unparsable,
    }
}

/// 千分位/小数点判定:
/// 同时出现 ',' 与 '.' 时以最后出现者为小数点；
/// 仅有 ',' 时，唯一且其后非 3 位数字视为小数点，否则为千分位；
/// 仅有多个 '.' 且均为 3 位分组 ("1.250.000") 时视为千分位
fn strip_grouping(s: &str) -> Option<String> {
    let last_comma = s.rfind(',');
    let last_dot = s.rfind('.');
    let out = match (last_comma, last_dot) {
        (Some(c), Some(d)) if c > d => s.replace('.', "").replace(',', "."),
        (Some(_), Some(_)) => s.replace(',', ""),
        (Some(c), None) => {
            let commas = s.matches(',').count();
            let after = s.len() - c - 1;
            if commas == 1 && after != 3 {
                s.replace(',', ".")
            } else {
                s.replace(',', "")
            }
        }
        (None, Some(_)) if s.matches('.').count() > 1 && is_grouped(s, '.') => s.replace('.', ""),
        (None, _) => s.to_string(),
    };
    (out.matches('.').count() <= 1).then_some(out)
}

/// 首段 1-3 位数字 (可带符号)，其后每段恰好 3 位
fn is_grouped(s: &str, sep: char) -> bool {
    let mut groups = s.split(sep);
    let head = groups.next().unwrap_or_default().trim_start_matches(['-', '+']);
    let head_ok = (1..=3).contains(&head.len()) && head.chars().all(|c| c.is_ascii_digit());
    head_ok && groups.all(|g| g.len() == 3 && g.chars().all(|c| c.is_ascii_digit()))
}

fn parse_currency(value: &Value) -> Parsed<String> {
    let Some(s) = value.as_str().map(str::trim) else {
        return Parsed::Unparsable;
    };
    if s.is_empty() {
        return Parsed::Absent;
    }
    if let Some((_, code)) = CURRENCY_SYMBOLS.iter().find(|(sym, _)| s.starts_with(*sym)) {
        return Parsed::Value(code.to_string());
    }
    if s.len() == 3 && s.chars().all(|c| c.is_ascii_alphabetic()) {
        return Parsed::Value(s.to_ascii_uppercase());
    }
    Parsed::Unparsable
}

/// 未提供币种时，从总金额文本中推断 ("$1,000" / "EUR 1000")
fn infer_currency(total: &Value) -> Option<String> {
    let s = total.as_str()?.trim();
    if let Some((_, code)) = CURRENCY_SYMBOLS.iter().find(|(sym, _)| s.contains(*sym)) {
        return Some(code.to_string());
    }
    let head: String = s.chars().take_while(|c| c.is_ascii_alphabetic()).collect();
    let tail: String = s
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    [head, tail]
        .into_iter()
        .find(|c| c.len() == 3)
        .map(|c| c.to_ascii_uppercase())
}
