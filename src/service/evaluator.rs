use bigdecimal::{BigDecimal, Zero};
use chrono::NaiveDate;
use std::collections::HashMap;
use std::fmt::Display;
use std::str::FromStr;

use crate::config::MatchingConfig;
use crate::models::{
    ComparisonScope, ComparisonStatus, FieldComparison, MatchPair, ParsedDocument,
};

pub const ANOMALY_INVOICE_BEFORE_PO: &str = "invoice_date_before_po_date";

/// 单侧取值: 值本身 + 是否为"存在但无法解析"
type Side<'a, T> = (Option<&'a T>, bool);

/// 差异评估器
///
/// 容差始终是两值中较大者的百分比，随单据金额放大而放大。
pub struct DiscrepancyEvaluator<'a> {
    config: &'a MatchingConfig,
    monetary_tolerance: BigDecimal,
    quantity_tolerance: BigDecimal,
    aliases: HashMap<String, String>,
}

impl<'a> DiscrepancyEvaluator<'a> {
    pub fn new(config: &'a MatchingConfig) -> Self {
        Self {
            config,
            monetary_tolerance: decimal_ratio(config.monetary_tolerance),
            quantity_tolerance: decimal_ratio(config.quantity_tolerance),
            aliases: config.alias_lookup(),
        }
    }

    /// 生成全部比较项，并回填每个配对的结论
    pub fn evaluate(
        &self,
        po: &ParsedDocument,
        invoice: &ParsedDocument,
        pairs: &mut [MatchPair],
    ) -> Vec<FieldComparison> {
        let mut out = self.compare_document(po, invoice);
        for (idx, pair) in pairs.iter_mut().enumerate() {
            let start = out.len();
            self.compare_pair(idx, pair, &mut out);
            pair.status = out[start..]
                .iter()
                .fold(ComparisonStatus::Match, |acc, c| acc.worst(c.status));
            if !pair.is_matched() {
                pair.status = ComparisonStatus::Mismatch;
            }
        }
        out
    }

    /// 单据级比较。PO 与发票各自编号，`document_number` 不直接互比；
    /// 仅当发票带有 `po_reference` 时，以其与 PO 单号 (经别名表映射后) 做精确比较。
    fn compare_document(&self, po: &ParsedDocument, inv: &ParsedDocument) -> Vec<FieldComparison> {
        let mut out = Vec::new();

        out.extend(self.compare_numeric(
            "total_amount",
            (Some(&po.total_amount), false),
            (Some(&inv.total_amount), false),
            &self.monetary_tolerance,
            ComparisonScope::Document,
            true,
        ));
        out.extend(self.compare_numeric(
            "tax_amount",
            (po.tax_amount.as_ref(), po.is_unparsed("tax_amount")),
            (inv.tax_amount.as_ref(), inv.is_unparsed("tax_amount")),
            &self.monetary_tolerance,
            ComparisonScope::Document,
            true,
        ));
        out.extend(self.compare_date(
            "document_date",
            (po.document_date.as_ref(), po.is_unparsed("document_date")),
            (inv.document_date.as_ref(), inv.is_unparsed("document_date")),
        ));
        out.extend(compare_text(
            "currency",
            (po.currency.as_ref(), po.is_unparsed("currency")),
            (inv.currency.as_ref(), inv.is_unparsed("currency")),
            |a, b| a == b,
        ));

        // 发票引用的 PO 号 vs PO 单号，先经别名表统一
        if let Some(reference) = &inv.po_reference {
            let po_number = self.canonical_number(&po.document_number);
            let inv_ref = self.canonical_number(reference);
            out.push(text_comparison(
                "po_reference",
                Some(&po.document_number),
                Some(reference),
                po_number == inv_ref,
            ));
        }

        out.extend(compare_text(
            "vendor_name",
            (po.vendor_name.as_ref(), false),
            (inv.vendor_name.as_ref(), false),
            |a, b| a.trim().eq_ignore_ascii_case(b.trim()),
        ));

        out
    }

    fn compare_pair(&self, idx: usize, pair: &MatchPair, out: &mut Vec<FieldComparison>) {
        let quantity = format!("line_items[{idx}].quantity");
        let line_total = format!("line_items[{idx}].line_total");

        match (&pair.po_item, &pair.invoice_item) {
            (Some(po), Some(inv)) => {
                out.extend(self.compare_numeric(
                    &quantity,
                    (po.quantity.as_ref(), po.is_unparsed("quantity")),
                    (inv.quantity.as_ref(), inv.is_unparsed("quantity")),
                    &self.quantity_tolerance,
                    ComparisonScope::LineItem,
                    false,
                ));
                out.extend(self.compare_numeric(
                    &line_total,
                    (po.line_total.as_ref(), po.is_unparsed("line_total")),
                    (inv.line_total.as_ref(), inv.is_unparsed("line_total")),
                    &self.monetary_tolerance,
                    ComparisonScope::LineItem,
                    true,
                ));
            }
            // 缺少配对方的一侧，每个比较字段都判为 MISMATCH
            (po, inv) => {
                let present = po.as_ref().or(inv.as_ref());
                let on_po = po.is_some();
                for (name, value, monetary) in [
                    (&quantity, present.and_then(|i| i.quantity.as_ref()), false),
                    (&line_total, present.and_then(|i| i.line_total.as_ref()), true),
                ] {
                    let rendered = value.map(|v| v.to_string());
                    out.push(FieldComparison {
                        field_name: name.clone(),
                        po_value: if on_po { rendered.clone() } else { None },
                        invoice_value: if on_po { None } else { rendered },
                        status: ComparisonStatus::Mismatch,
                        delta: None,
                        scope: ComparisonScope::LineItem,
                        monetary,
                    });
                }
            }
        }
    }

    /// 数值比较: 双方缺失且未标记则跳过；任一方缺失或无法解析则 MISMATCH
    fn compare_numeric(
        &self,
        field: &str,
        po: Side<'_, BigDecimal>,
        inv: Side<'_, BigDecimal>,
        tolerance: &BigDecimal,
        scope: ComparisonScope,
        monetary: bool,
    ) -> Option<FieldComparison> {
        let (status, delta) = match (po.0, inv.0) {
            (None, None) if !po.1 && !inv.1 => return None,
            (Some(a), Some(b)) => {
                let (status, delta) = classify(a, b, tolerance);
                (status, Some(delta))
            }
            _ => (ComparisonStatus::Mismatch, None),
        };
        Some(FieldComparison {
            field_name: field.to_string(),
            po_value: po.0.map(|v| v.to_string()),
            invoice_value: inv.0.map(|v| v.to_string()),
            status,
            delta,
            scope,
            monetary,
        })
    }

    /// 日期比较: 同日 MATCH，窗口内 TOLERATED；仅当双方都有日期或有一方无法解析时比较
    fn compare_date(
        &self,
        field: &str,
        po: Side<'_, NaiveDate>,
        inv: Side<'_, NaiveDate>,
    ) -> Option<FieldComparison> {
        let (status, delta) = match (po.0, inv.0) {
            (Some(a), Some(b)) => {
                let days = (*b - *a).num_days().abs();
                let status = if days == 0 {
                    ComparisonStatus::Match
                } else if days <= i64::from(self.config.date_window_days) {
                    ComparisonStatus::Tolerated
                } else {
                    ComparisonStatus::Mismatch
                };
                (status, Some(BigDecimal::from(days)))
            }
            _ if po.1 || inv.1 => (ComparisonStatus::Mismatch, None),
            _ => return None,
        };
        Some(FieldComparison {
            field_name: field.to_string(),
            po_value: po.0.map(|d| d.to_string()),
            invoice_value: inv.0.map(|d| d.to_string()),
            status,
            delta,
            scope: ComparisonScope::Document,
            monetary: false,
        })
    }

    fn canonical_number(&self, number: &str) -> String {
        let trimmed = number.trim();
        self.aliases
            .get(trimmed)
            .cloned()
            .unwrap_or_else(|| trimmed.to_string())
    }
}

/// 状态规则: delta == 0 为 MATCH；delta <= 容差 × max(|a|,|b|) 为 TOLERATED；否则 MISMATCH
pub fn classify(a: &BigDecimal, b: &BigDecimal, tolerance: &BigDecimal) -> (ComparisonStatus, BigDecimal) {
    let delta = (a - b).abs();
    if delta.is_zero() {
        return (ComparisonStatus::Match, delta);
    }
    let allowed = a.abs().max(b.abs()) * tolerance;
    let status = if delta <= allowed {
        ComparisonStatus::Tolerated
    } else {
        ComparisonStatus::Mismatch
    };
    (status, delta)
}

/// 发票日期早于 PO 日期等异常提示，不影响整体结论
pub fn detect_anomalies(po: &ParsedDocument, invoice: &ParsedDocument) -> Vec<String> {
    let mut anomalies = Vec::new();
    if let (Some(po_date), Some(inv_date)) = (po.document_date, invoice.document_date) {
        if inv_date < po_date {
            anomalies.push(ANOMALY_INVOICE_BEFORE_PO.to_string());
        }
    }
    anomalies
}

fn compare_text<T: Display>(
    field: &str,
    po: Side<'_, T>,
    inv: Side<'_, T>,
    eq: impl Fn(&T, &T) -> bool,
) -> Option<FieldComparison> {
    match (po.0, inv.0) {
        (Some(a), Some(b)) => Some(text_comparison(field, Some(a), Some(b), eq(a, b))),
        _ if po.1 || inv.1 => Some(text_comparison(field, po.0, inv.0, false)),
        _ => None,
    }
}

fn text_comparison<T: Display>(field: &str, po: Option<&T>, inv: Option<&T>, equal: bool) -> FieldComparison {
    FieldComparison {
        field_name: field.to_string(),
        po_value: po.map(|v| v.to_string()),
        invoice_value: inv.map(|v| v.to_string()),
        status: if equal {
            ComparisonStatus::Match
        } else {
            ComparisonStatus::Mismatch
        },
        delta: None,
        scope: ComparisonScope::Document,
        monetary: false,
    }
}

/// f64 比例转定点十进制 (经由十进制文本，避免二进制误差)
fn decimal_ratio(ratio: f64) -> BigDecimal {
    BigDecimal::from_str(&ratio.to_string()).unwrap_or_else(|_| BigDecimal::zero())
}
