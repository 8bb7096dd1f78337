//! Persistent Store Interface
//!
//! 永続ストア（ホスティングされたデータベース）への境界。
//! コンプライアンスコアはこのトレイト越しにのみ行を読み書きし、
//! ストア実装の例外を外側へ漏らさない。

pub mod memory;

use crate::compliance::types::ConsentRecord;
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

pub use memory::MemoryStore;

/// ユーザー所有データのドメイン（テーブル単位）
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DataDomain {
    /// プロフィール（コアレコード・削除は最後）
    Profile,
    /// 設定・嗜好
    Preferences,
    /// 行動履歴
    Activity,
    /// レシピ
    Recipes,
    /// 同意記録
    Consents,
    /// API利用ログ
    UsageLogs,
    /// 監査ログ
    AuditLogs,
}

impl DataDomain {
    /// エクスポート対象のドメイン
    pub fn export_domains() -> [DataDomain; 4] {
        [
            DataDomain::Profile,
            DataDomain::Preferences,
            DataDomain::Activity,
            DataDomain::Recipes,
        ]
    }

    /// アカウント削除時に先に掃除する従属ドメイン
    ///
    /// プロフィールは含まれない。プロフィール削除の成功が削除完了の
    /// 確定シグナルであり、必ず最後に実行される。
    pub fn dependent_domains() -> [DataDomain; 6] {
        [
            DataDomain::Preferences,
            DataDomain::Activity,
            DataDomain::Recipes,
            DataDomain::Consents,
            DataDomain::UsageLogs,
            DataDomain::AuditLogs,
        ]
    }

    /// テーブル名
    pub fn table_name(&self) -> &'static str {
        match self {
            DataDomain::Profile => "users",
            DataDomain::Preferences => "preferences",
            DataDomain::Activity => "activity",
            DataDomain::Recipes => "recipes",
            DataDomain::Consents => "email_consents",
            DataDomain::UsageLogs => "usage_logs",
            DataDomain::AuditLogs => "audit_logs",
        }
    }
}

impl fmt::Display for DataDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.table_name())
    }
}

/// 永続ストアへの操作
#[async_trait]
pub trait DataStore: Send + Sync {
    /// 同意記録を取得（メールアドレスは小文字の自然キー）
    async fn get_consent(&self, email: &str) -> Result<Option<ConsentRecord>>;

    /// 同意記録をupsert（自然キーはemail・重複は作らない）
    async fn upsert_consent(&self, record: &ConsentRecord) -> Result<()>;

    /// ドメイン内のユーザー所有行を取得
    async fn fetch_user_rows(
        &self,
        domain: DataDomain,
        user_id: &str,
    ) -> Result<Vec<serde_json::Value>>;

    /// ドメイン内のユーザー所有行を削除し、削除件数を返す
    async fn delete_user_rows(&self, domain: DataDomain, user_id: &str) -> Result<u64>;

    /// コアプロフィールレコードを削除
    async fn delete_profile(&self, user_id: &str) -> Result<()>;
}
