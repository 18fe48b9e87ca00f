use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// 公司主表
///
/// 注册后名称不可变，仅联系人字段可更新；引擎从不删除公司。
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq)]
pub struct Company {
    pub id: i64,
    pub name: String,
    pub contact_person: Option<String>,
    pub email: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// 注册公司请求
#[derive(Debug, Clone, Deserialize)]
pub struct NewCompany {
    pub name: String,
    pub contact_person: Option<String>,
    pub email: Option<String>,
}

/// 联系人更新 (None 表示保持不变)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContactUpdate {
    pub contact_person: Option<String>,
    pub email: Option<String>,
}

impl Company {
    pub fn apply_contact(&mut self, update: &ContactUpdate) {
        if let Some(person) = &update.contact_person {
            self.contact_person = Some(person.clone());
        }
        if let Some(email) = &update.email {
            self.email = Some(email.clone());
        }
    }
}
