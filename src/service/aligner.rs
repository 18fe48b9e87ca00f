use bigdecimal::{BigDecimal, ToPrimitive, Zero};
use indexmap::IndexSet;
use rayon::prelude::*;

use crate::config::{MatchingConfig, SimilarityWeights};
use crate::models::{ComparisonStatus, LineItem, MatchPair};

/// 候选配对 (po 下标, 发票下标, 相似度)
#[derive(Debug, Clone, Copy)]
struct Candidate {
    po: usize,
    invoice: usize,
    score: f64,
}

#[derive(Debug, Clone, Copy)]
struct Score {
    weighted: f64,
    text: f64,
}

/// 明细对齐器
///
/// 对所有 PO × 发票明细计算加权相似度，按分数降序贪心选取未占用的组合，
/// 同分时取较小的 PO 下标、再取较小的发票下标，保证结果确定。
/// 候选需同时满足: 加权分 > min_similarity 且文本相似度 > min_text_similarity。
pub struct LineItemAligner<'a> {
    weights: &'a SimilarityWeights,
    min_similarity: f64,
    min_text_similarity: f64,
}

impl<'a> LineItemAligner<'a> {
    pub fn new(config: &'a MatchingConfig) -> Self {
        Self {
            weights: &config.weights,
            min_similarity: config.min_similarity,
            min_text_similarity: config.min_text_similarity,
        }
    }

    /// 输出顺序: 按 PO 明细原顺序 (已配对或未配对)，其后是未配对的发票明细
    pub fn align(&self, po_items: &[LineItem], invoice_items: &[LineItem]) -> Vec<MatchPair> {
        let matrix = self.score_matrix(po_items, invoice_items);

        let mut candidates: Vec<Candidate> = matrix
            .iter()
            .enumerate()
            .flat_map(|(po, row)| {
                row.iter()
                    .enumerate()
                    .filter(|(_, s)| s.text > self.min_text_similarity)
                    .map(move |(invoice, s)| Candidate {
                        po,
                        invoice,
                        score: s.weighted,
                    })
            })
            .filter(|c| c.score > self.min_similarity)
            .collect();

        candidates.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.po.cmp(&b.po))
                .then_with(|| a.invoice.cmp(&b.invoice))
        });

        let mut partner_of_po: Vec<Option<(usize, f64)>> = vec![None; po_items.len()];
        let mut used_invoices: IndexSet<usize> = IndexSet::new();
        for c in candidates {
            if partner_of_po[c.po].is_some() || used_invoices.contains(&c.invoice) {
                continue;
            }
            partner_of_po[c.po] = Some((c.invoice, c.score));
            used_invoices.insert(c.invoice);
        }

        let mut pairs = Vec::with_capacity(po_items.len() + invoice_items.len() - used_invoices.len());
        for (po_idx, po_item) in po_items.iter().enumerate() {
            let pair = match partner_of_po[po_idx] {
                Some((inv_idx, score)) => MatchPair {
                    po_index: Some(po_idx),
                    invoice_index: Some(inv_idx),
                    po_item: Some(po_item.clone()),
                    invoice_item: Some(invoice_items[inv_idx].clone()),
                    similarity: score,
                    status: ComparisonStatus::Match,
                },
                None => MatchPair {
                    po_index: Some(po_idx),
                    invoice_index: None,
                    po_item: Some(po_item.clone()),
                    invoice_item: None,
                    similarity: 0.0,
                    status: ComparisonStatus::Mismatch,
                },
            };
            pairs.push(pair);
        }
        for (inv_idx, inv_item) in invoice_items.iter().enumerate() {
            if used_invoices.contains(&inv_idx) {
                continue;
            }
            pairs.push(MatchPair {
                po_index: None,
                invoice_index: Some(inv_idx),
                po_item: None,
                invoice_item: Some(inv_item.clone()),
                similarity: 0.0,
                status: ComparisonStatus::Mismatch,
            });
        }

        tracing::debug!(
            "[Align] PO明细 {} 条, 发票明细 {} 条, 配对 {} 组",
            po_items.len(),
            invoice_items.len(),
            used_invoices.len()
        );
        pairs
    }

    /// 相似度矩阵，按行并行计算，结果按下标顺序收集
    fn score_matrix(&self, po_items: &[LineItem], invoice_items: &[LineItem]) -> Vec<Vec<Score>> {
        po_items
            .par_iter()
            .map(|po| {
                invoice_items
                    .iter()
                    .map(|inv| self.score(po, inv))
                    .collect()
            })
            .collect()
    }

    /// 加权相似度，归一化到 [0, 1]
    pub fn similarity(&self, po: &LineItem, invoice: &LineItem) -> f64 {
        self.score(po, invoice).weighted
    }

    fn score(&self, po: &LineItem, invoice: &LineItem) -> Score {
        let w = self.weights;
        let text = text_similarity(po, invoice);
        let qty = proximity(po.quantity.as_ref(), invoice.quantity.as_ref());
        let price = proximity(po.unit_price.as_ref(), invoice.unit_price.as_ref());
        Score {
            weighted: (w.description * text + w.quantity * qty + w.unit_price * price) / w.total(),
            text,
        }
    }
}

/// 描述与 SKU 的文本相似度；双方都有 SKU 时两者各占一半
fn text_similarity(po: &LineItem, invoice: &LineItem) -> f64 {
    let desc = string_similarity(&po.description, &invoice.description);
    match (&po.sku, &invoice.sku) {
        (Some(a), Some(b)) => 0.5 * desc + 0.5 * string_similarity(a, b),
        _ => desc,
    }
}

fn string_similarity(a: &str, b: &str) -> f64 {
    let a = canonical_text(a);
    let b = canonical_text(b);
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    if a == b {
        return 1.0;
    }
    strsim::normalized_levenshtein(&a, &b).max(strsim::sorensen_dice(&a, &b))
}

fn canonical_text(s: &str) -> String {
    s.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// 相对差的反比: 1 - |a-b| / max(|a|,|b|)；任一缺失为 0
fn proximity(a: Option<&BigDecimal>, b: Option<&BigDecimal>) -> f64 {
    let (Some(a), Some(b)) = (a, b) else {
        return 0.0;
    };
    let larger = a.abs().max(b.abs());
    if larger.is_zero() {
        return 1.0;
    }
    let rel = ((a - b).abs() / larger).to_f64().unwrap_or(1.0);
    (1.0 - rel).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn item(desc: &str, qty: &str, price: &str) -> LineItem {
        let mut it = LineItem::new(desc);
        it.quantity = Some(BigDecimal::from_str(qty).unwrap());
        it.unit_price = Some(BigDecimal::from_str(price).unwrap());
        it.line_total = Some(it.quantity.clone().unwrap() * it.unit_price.clone().unwrap());
        it
    }

    fn align(po: &[LineItem], inv: &[LineItem]) -> Vec<MatchPair> {
        let config = MatchingConfig::default();
        LineItemAligner::new(&config).align(po, inv)
    }

    fn indices(pairs: &[MatchPair]) -> Vec<(Option<usize>, Option<usize>)> {
        pairs.iter().map(|p| (p.po_index, p.invoice_index)).collect()
    }

    #[test]
    fn pairs_reordered_items() {
        let po = vec![item("Steel bolts M8", "500", "0.10"), item("Office chair", "4", "120.00")];
        let inv = vec![item("office chair", "4", "120.00"), item("Steel Bolts M8", "500", "0.10")];

        let pairs = align(&po, &inv);
        assert_eq!(indices(&pairs), vec![(Some(0), Some(1)), (Some(1), Some(0))]);
        assert!(pairs.iter().all(|p| (p.similarity - 1.0).abs() < 1e-9));
    }

    #[test]
    fn unrelated_items_stay_unmatched() {
        let po = vec![
            item("Steel bolts M8", "500", "0.10"),
            item("Office chair", "4", "120.00"),
            item("Printer paper A4", "20", "5.50"),
        ];
        let inv = vec![
            item("Office chair", "4", "120.00"),
            item("Printer paper A4", "20", "5.50"),
            item("Consulting services", "1", "850.00"),
        ];

        let pairs = align(&po, &inv);
        assert_eq!(
            indices(&pairs),
            vec![
                (Some(0), None),
                (Some(1), Some(0)),
                (Some(2), Some(1)),
                (None, Some(2)),
            ]
        );
        assert_eq!(pairs.iter().filter(|p| p.is_matched()).count(), 2);
        assert_eq!(pairs[0].status, ComparisonStatus::Mismatch);
        assert_eq!(pairs[3].status, ComparisonStatus::Mismatch);
    }

    #[test]
    fn empty_side_leaves_other_side_unmatched() {
        let po = vec![item("Widget", "1", "1.00"), item("Gadget", "2", "2.00")];
        let pairs = align(&po, &[]);
        assert_eq!(indices(&pairs), vec![(Some(0), None), (Some(1), None)]);

        let pairs = align(&[], &po);
        assert_eq!(indices(&pairs), vec![(None, Some(0)), (None, Some(1))]);
    }

    #[test]
    fn duplicates_pair_first_with_first() {
        let po = vec![item("Widget", "1", "9.99"), item("Widget", "1", "9.99")];
        let inv = vec![item("Widget", "1", "9.99"), item("Widget", "1", "9.99")];
        let pairs = align(&po, &inv);
        assert_eq!(indices(&pairs), vec![(Some(0), Some(0)), (Some(1), Some(1))]);
    }

    #[test]
    fn alignment_is_deterministic() {
        let po = vec![
            item("Cable CAT6 5m", "10", "4.00"),
            item("Cable CAT6 10m", "10", "6.00"),
            item("Switch 24 port", "1", "300.00"),
        ];
        let inv = vec![
            item("CAT6 cable 10m", "10", "6.00"),
            item("Switch 24-port", "1", "295.00"),
            item("CAT6 cable 5m", "10", "4.00"),
        ];
        let first = align(&po, &inv);
        for _ in 0..5 {
            assert_eq!(align(&po, &inv), first);
        }
    }

    #[test]
    fn sku_match_raises_similarity() {
        let config = MatchingConfig::default();
        let aligner = LineItemAligner::new(&config);
        let mut a = item("Hex bolt", "100", "0.20");
        let mut b = item("Bolt hexagonal zinc", "100", "0.20");
        let without = aligner.similarity(&a, &b);
        a.sku = Some("HB-100".into());
        b.sku = Some("hb-100".into());
        assert!(aligner.similarity(&a, &b) > without);
    }

    #[test]
    fn matching_numbers_alone_do_not_pair_unrelated_items() {
        let po = vec![item("Office chair", "4", "120.00"), item("Printer toner cartridge", "1", "50.00")];
        let inv = vec![item("Office chair", "4", "120.00"), item("Consulting hours", "1", "50.00")];

        let config = MatchingConfig::default();
        assert!(LineItemAligner::new(&config).similarity(&po[1], &inv[1]) > config.min_similarity);

        let pairs = align(&po, &inv);
        assert_eq!(
            indices(&pairs),
            vec![(Some(0), Some(0)), (Some(1), None), (None, Some(1))]
        );
    }

    #[test]
    fn proximity_scales_relatively() {
        let d = |s: &str| BigDecimal::from_str(s).unwrap();
        assert_eq!(proximity(Some(&d("10")), Some(&d("10"))), 1.0);
        assert!((proximity(Some(&d("100")), Some(&d("50"))) - 0.5).abs() < 1e-9);
        assert_eq!(proximity(Some(&d("0")), Some(&d("0"))), 1.0);
        assert_eq!(proximity(None, Some(&d("3"))), 0.0);
    }
}
