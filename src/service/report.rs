use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{AppError, AppResult};
use crate::models::MatchResult;

/// 报告相对路径前缀，客户端以服务基地址拼接
pub const REPORT_ROUTE_PREFIX: &str = "reports";

/// 匹配报告写入器
///
/// 每次匹配生成独立文件: `<po>_<invoice>_<UTC时间戳>_<序号>.json` 及同名 CSV。
/// 三步提交: [`reserve`](Self::reserve) 以隐藏占位文件预留文件名，
/// [`stage`](Self::stage) 写入临时文件，[`StagedReport::publish`] 同步硬链接为正式文件。
/// 发布前任何一步失败或被取消，目录中都不会出现正式报告；从不覆盖旧报告。
#[derive(Debug, Clone)]
pub struct ReportWriter {
    dir: PathBuf,
    seq: Arc<AtomicU64>,
}

impl ReportWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            seq: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// 预留唯一文件名；占位文件随 [`ReportSlot`] 释放而删除
    pub fn reserve(&self, result: &MatchResult) -> AppResult<ReportSlot> {
        std::fs::create_dir_all(&self.dir)?;
        let timestamp = result.created_at.format("%Y%m%dT%H%M%S%3fZ").to_string();

        loop {
            let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
            let mut slot = ReportSlot {
                dir: self.dir.clone(),
                stem: format!(
                    "{}_{}_{}_{:04}",
                    result.po_document_id, result.invoice_document_id, timestamp, seq
                ),
                held: false,
            };
            if slot.csv_target().exists() || slot.json_target().exists() {
                continue;
            }
            match OpenOptions::new().write(true).create_new(true).open(slot.marker()) {
                Ok(_) => {
                    slot.held = true;
                    return Ok(slot);
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    tracing::warn!("[Report] {} 已被占用, 更换序号重试", slot.stem);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// 写临时文件。在阻塞线程中完成，调用方被取消时临时文件随结果一起清理
    pub async fn stage(&self, slot: &ReportSlot, result: &MatchResult) -> AppResult<StagedReport> {
        let csv = render_csv(result)?;
        let json = serde_json::to_vec_pretty(result)?;
        let nonce = uuid::Uuid::new_v4().simple().to_string();
        let staged = StagedReport {
            csv_tmp: self.dir.join(format!(".{}.csv.{nonce}.tmp", slot.stem)),
            json_tmp: self.dir.join(format!(".{}.json.{nonce}.tmp", slot.stem)),
            csv_target: slot.csv_target(),
            json_target: slot.json_target(),
        };

        tokio::task::spawn_blocking(move || -> AppResult<StagedReport> {
            std::fs::write(&staged.csv_tmp, &csv)?;
            std::fs::write(&staged.json_tmp, &json)?;
            Ok(staged)
        })
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?
    }

    /// 读取已生成的报告文件，拒绝路径穿越
    pub async fn read(&self, name: &str) -> AppResult<Vec<u8>> {
        let path = self.resolve(name)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(AppError::NotFound(format!("Report '{name}' not found")))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn resolve(&self, name: &str) -> AppResult<PathBuf> {
        let valid = !name.is_empty()
            && !name.starts_with('.')
            && !name.contains(['/', '\\'])
            && !name.contains("..")
            && (name.ends_with(".json") || name.ends_with(".csv"));
        if !valid {
            return Err(AppError::NotFound(format!("Report '{name}' not found")));
        }
        Ok(self.dir.join(name))
    }
}

/// 已预留的报告文件名
#[derive(Debug)]
pub struct ReportSlot {
    dir: PathBuf,
    stem: String,
    held: bool,
}

impl ReportSlot {
    /// 客户端可见的相对路径
    pub fn report_path(&self) -> String {
        format!("{REPORT_ROUTE_PREFIX}/{}.json", self.stem)
    }

    fn marker(&self) -> PathBuf {
        self.dir.join(format!(".{}.reserve", self.stem))
    }

    fn csv_target(&self) -> PathBuf {
        self.dir.join(format!("{}.csv", self.stem))
    }

    fn json_target(&self) -> PathBuf {
        self.dir.join(format!("{}.json", self.stem))
    }
}

impl Drop for ReportSlot {
    fn drop(&mut self) {
        if self.held {
            let _ = std::fs::remove_file(self.marker());
        }
    }
}

/// 已写入临时文件、尚未发布的报告；未发布即释放时删除临时文件
#[derive(Debug)]
pub struct StagedReport {
    csv_tmp: PathBuf,
    json_tmp: PathBuf,
    csv_target: PathBuf,
    json_target: PathBuf,
}

impl StagedReport {
    /// 发布为正式文件: 先 CSV 后 JSON，JSON 失败时撤回 CSV。
    /// 全程同步，不存在可被取消的中间状态
    pub fn publish(self) -> AppResult<()> {
        std::fs::hard_link(&self.csv_tmp, &self.csv_target)?;
        if let Err(e) = std::fs::hard_link(&self.json_tmp, &self.json_target) {
            let _ = std::fs::remove_file(&self.csv_target);
            tracing::error!("✗ 报告 {} 发布失败, 已撤回 CSV: {}", self.json_target.display(), e);
            return Err(e.into());
        }
        tracing::info!("[Report] 报告已写入: {}", self.json_target.display());
        Ok(())
    }
}

impl Drop for StagedReport {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.csv_tmp);
        let _ = std::fs::remove_file(&self.json_tmp);
    }
}

/// 每个比较项一行
fn render_csv(result: &MatchResult) -> AppResult<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    let to_err = |e: csv::Error| AppError::Internal(e.to_string());

    writer
        .write_record([
            "field_name",
            "po_value",
            "invoice_value",
            "status",
            "delta",
            "scope",
        ])
        .map_err(to_err)?;
    for c in &result.field_comparisons {
        writer
            .write_record([
                c.field_name.clone(),
                c.po_value.clone().unwrap_or_default(),
                c.invoice_value.clone().unwrap_or_default(),
                c.status.as_str().to_string(),
                c.delta.as_ref().map(|d| d.to_string()).unwrap_or_default(),
                format!("{:?}", c.scope).to_lowercase(),
            ])
            .map_err(to_err)?;
    }
    writer
        .into_inner()
        .map_err(|e| AppError::Internal(e.to_string()))
}
