use std::path::{Path, PathBuf};

use crate::error::{AppError, AppResult};

/// 上传原件存储 (本地目录)
#[derive(Debug, Clone)]
pub struct UploadStore {
    dir: PathBuf,
    max_bytes: usize,
}

impl UploadStore {
    pub fn new(dir: impl Into<PathBuf>, max_bytes: usize) -> Self {
        Self {
            dir: dir.into(),
            max_bytes,
        }
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// 保存上传文件，文件名为 uuid + 原扩展名，返回存储路径
    pub async fn save(&self, original_name: &str, bytes: &[u8]) -> AppResult<String> {
        if bytes.is_empty() {
            return Err(AppError::InvalidRequest("Uploaded file is empty".to_string()));
        }
        if bytes.len() > self.max_bytes {
            return Err(AppError::InvalidRequest(format!(
                "File exceeds maximum upload size of {} MB",
                self.max_bytes / (1024 * 1024)
            )));
        }

        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.dir.join(unique_filename(original_name));
        tokio::fs::write(&path, bytes).await?;
        tracing::debug!("[Upload] 保存文件 {} ({} bytes)", path.display(), bytes.len());
        Ok(path.to_string_lossy().into_owned())
    }

    /// 尽力删除 (建档失败时回滚)
    pub async fn discard(&self, stored_path: &str) {
        if let Err(e) = tokio::fs::remove_file(stored_path).await {
            tracing::warn!("[Upload] 回滚删除 {} 失败: {}", stored_path, e);
        }
    }
}

fn unique_filename(original_name: &str) -> String {
    let ext = Path::new(original_name)
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| !e.is_empty() && e.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(|e| format!(".{}", e.to_ascii_lowercase()))
        .unwrap_or_default();
    format!("{}{}", uuid::Uuid::new_v4().simple(), ext)
}
