//! In-Memory Store
//!
//! テスト・単体実行用のインメモリ実装。本番構成ではホスティングされた
//! データベースを `DataStore` 実装でラップして差し替える。

use super::{DataDomain, DataStore};
use crate::compliance::types::ConsentRecord;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

/// インメモリストア
#[derive(Debug, Default)]
pub struct MemoryStore {
    /// 同意記録（email -> 記録）
    consents: Arc<RwLock<HashMap<String, ConsentRecord>>>,
    /// ドメイン別のユーザー所有行
    rows: Arc<RwLock<HashMap<DataDomain, HashMap<String, Vec<serde_json::Value>>>>>,
    /// 同意読み取りを失敗させる（フェイルクローズ検証用）
    fail_consent_reads: AtomicBool,
    /// プロフィール削除を失敗させる
    fail_profile_delete: AtomicBool,
    /// 読み書きを失敗させるドメイン
    failing_domains: Arc<RwLock<HashSet<DataDomain>>>,
}

impl MemoryStore {
    /// 新しいインメモリストアを作成
    pub fn new() -> Self {
        Self::default()
    }

    /// ドメインにユーザー所有行を投入
    pub async fn seed_rows(
        &self,
        domain: DataDomain,
        user_id: &str,
        rows: Vec<serde_json::Value>,
    ) {
        let mut all = self.rows.write().await;
        all.entry(domain)
            .or_default()
            .entry(user_id.to_string())
            .or_default()
            .extend(rows);
    }

    /// ドメインの行数を取得
    pub async fn row_count(&self, domain: DataDomain, user_id: &str) -> usize {
        let all = self.rows.read().await;
        all.get(&domain)
            .and_then(|by_user| by_user.get(user_id))
            .map(|rows| rows.len())
            .unwrap_or(0)
    }

    /// 同意読み取りの失敗を切り替え
    pub fn set_fail_consent_reads(&self, fail: bool) {
        self.fail_consent_reads.store(fail, Ordering::SeqCst);
    }

    /// プロフィール削除の失敗を切り替え
    pub fn set_fail_profile_delete(&self, fail: bool) {
        self.fail_profile_delete.store(fail, Ordering::SeqCst);
    }

    /// 指定ドメインの操作を失敗させる
    pub async fn set_fail_domain(&self, domain: DataDomain, fail: bool) {
        let mut failing = self.failing_domains.write().await;
        if fail {
            failing.insert(domain);
        } else {
            failing.remove(&domain);
        }
    }

    async fn check_domain(&self, domain: DataDomain) -> Result<()> {
        let failing = self.failing_domains.read().await;
        if failing.contains(&domain) {
            return Err(Error::Store(format!(
                "simulated failure for domain {}",
                domain
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl DataStore for MemoryStore {
    async fn get_consent(&self, email: &str) -> Result<Option<ConsentRecord>> {
        if self.fail_consent_reads.load(Ordering::SeqCst) {
            return Err(Error::Store("simulated consent lookup failure".to_string()));
        }
        let consents = self.consents.read().await;
        Ok(consents.get(&email.to_lowercase()).cloned())
    }

    async fn upsert_consent(&self, record: &ConsentRecord) -> Result<()> {
        let mut consents = self.consents.write().await;
        consents.insert(record.email.clone(), record.clone());
        Ok(())
    }

    async fn fetch_user_rows(
        &self,
        domain: DataDomain,
        user_id: &str,
    ) -> Result<Vec<serde_json::Value>> {
        self.check_domain(domain).await?;
        let all = self.rows.read().await;
        Ok(all
            .get(&domain)
            .and_then(|by_user| by_user.get(user_id))
            .cloned()
            .unwrap_or_default())
    }

    async fn delete_user_rows(&self, domain: DataDomain, user_id: &str) -> Result<u64> {
        self.check_domain(domain).await?;
        let mut all = self.rows.write().await;
        let removed = all
            .get_mut(&domain)
            .and_then(|by_user| by_user.remove(user_id))
            .map(|rows| rows.len() as u64)
            .unwrap_or(0);
        Ok(removed)
    }

    async fn delete_profile(&self, user_id: &str) -> Result<()> {
        if self.fail_profile_delete.load(Ordering::SeqCst) {
            return Err(Error::Store("simulated profile delete failure".to_string()));
        }
        let mut all = self.rows.write().await;
        if let Some(by_user) = all.get_mut(&DataDomain::Profile) {
            by_user.remove(user_id);
        }
        Ok(())
    }
}
