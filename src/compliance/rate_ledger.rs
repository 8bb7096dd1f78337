//! Rate & Retention Ledger
//!
//! 外部プロバイダーへの呼び出し可否を固定ウィンドウカウンターで判定し、
//! キャッシュされたパートナーデータの保持期限を追跡する。
//! カウンター状態はプロセスローカルであり、水平スケール時は
//! インスタンスごとに独立した台帳になる（既知の制約）。

use super::audit_log::AuditLog;
use super::types::{CachedDataClass, CachedDataRecord, PolicyDecision, ViolationType};
use crate::config::{ComplianceConfig, ProviderPolicy};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

/// レート・保持台帳
pub struct RateLedger {
    /// プロバイダー別ポリシー
    providers: HashMap<String, ProviderPolicy>,
    /// PIIクラスの保持期間
    pii_retention: Duration,
    /// リクエストカウンター（時間キーと日次キーを同一マップに保持）
    ///
    /// チェックとインクリメントは同一ロックガード内で行う。
    /// 並行呼び出しが両方とも上限未満を観測して揃って超過する競合を防ぐ。
    counters: Arc<Mutex<HashMap<String, u64>>>,
    /// キャッシュデータ記録（"{provider}:{data_id}" キー）
    cached: Arc<RwLock<HashMap<String, CachedDataRecord>>>,
    /// 監査ログ
    audit: Arc<AuditLog>,
    /// 追跡したリクエスト総数（累積）
    total_tracked: AtomicU64,
    /// 拒否したリクエスト総数（累積）
    total_denied: AtomicU64,
    /// 保持スイープの多重起動ガード
    sweep_in_progress: AtomicBool,
}

impl RateLedger {
    /// 新しい台帳を作成
    pub fn new(config: &ComplianceConfig, audit: Arc<AuditLog>) -> Self {
        Self {
            providers: config.providers.clone(),
            pii_retention: Duration::days(config.pii_retention_days),
            counters: Arc::new(Mutex::new(HashMap::new())),
            cached: Arc::new(RwLock::new(HashMap::new())),
            audit,
            total_tracked: AtomicU64::new(0),
            total_denied: AtomicU64::new(0),
            sweep_in_progress: AtomicBool::new(false),
        }
    }

    /// プロバイダー呼び出しの可否を判定
    ///
    /// 時間上限（分単位レート×60）を先に評価し、通過した場合のみ
    /// 日次上限を評価する。最初に破られた上限が報告される。
    /// 拒否された試行はカウンターを消費しない。
    pub async fn track_request(
        &self,
        provider: &str,
        endpoint: &str,
        user_id: Option<&str>,
    ) -> PolicyDecision {
        self.track_request_at(provider, endpoint, user_id, Utc::now())
            .await
    }

    async fn track_request_at(
        &self,
        provider: &str,
        endpoint: &str,
        user_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> PolicyDecision {
        let Some(policy) = self.providers.get(provider) else {
            self.total_denied.fetch_add(1, Ordering::Relaxed);
            self.audit
                .report_violation(
                    ViolationType::UnknownProvider,
                    provider,
                    endpoint,
                    user_id,
                    format!("provider '{}' is not configured", provider),
                )
                .await;
            return PolicyDecision::deny("unknown provider");
        };

        let hourly_limit = policy.requests_per_minute * 60;
        let daily_limit = policy.requests_per_day;
        let hour_key = hour_bucket_key(provider, now);
        let day_key = day_bucket_key(provider, now);

        // チェックとインクリメントを単一ガードで行う
        let denial = {
            let mut counters = self.counters.lock().await;
            let hour_count = counters.get(&hour_key).copied().unwrap_or(0);
            let day_count = counters.get(&day_key).copied().unwrap_or(0);

            if hour_count + 1 > hourly_limit {
                Some((
                    ViolationType::RateLimitMinute,
                    "hourly rate limit exceeded",
                    format!(
                        "hourly count {} at limit {} (daily {}/{})",
                        hour_count, hourly_limit, day_count, daily_limit
                    ),
                ))
            } else if day_count + 1 > daily_limit {
                Some((
                    ViolationType::RateLimitDaily,
                    "daily rate limit exceeded",
                    format!(
                        "daily count {} at limit {} (hourly {}/{})",
                        day_count, daily_limit, hour_count, hourly_limit
                    ),
                ))
            } else {
                *counters.entry(hour_key.clone()).or_insert(0) += 1;
                *counters.entry(day_key.clone()).or_insert(0) += 1;
                None
            }
        };

        match denial {
            Some((violation_type, reason, details)) => {
                self.total_denied.fetch_add(1, Ordering::Relaxed);
                self.audit
                    .report_violation(violation_type, provider, endpoint, user_id, details)
                    .await;
                PolicyDecision::deny(reason)
            }
            None => {
                self.total_tracked.fetch_add(1, Ordering::Relaxed);
                let (hour_count, day_count) = {
                    let counters = self.counters.lock().await;
                    (
                        counters.get(&hour_key).copied().unwrap_or(0),
                        counters.get(&day_key).copied().unwrap_or(0),
                    )
                };
                self.audit
                    .record(
                        "api_request",
                        provider,
                        serde_json::json!({
                            "endpoint": endpoint,
                            "user_id": user_id,
                            "hourly_count": hour_count,
                            "hourly_limit": hourly_limit,
                            "daily_count": day_count,
                            "daily_limit": daily_limit,
                        }),
                    )
                    .await;
                PolicyDecision::allow()
            }
        }
    }

    /// キャッシュしたパートナーデータを登録
    ///
    /// 失効日時は登録時点でプロバイダー保持期間から確定する。
    /// この操作はゲートではなく帳簿付けであり、常に成功する。
    pub async fn track_cached_data(
        &self,
        provider: &str,
        data_id: &str,
        data_size: u64,
        user_id: Option<&str>,
        class: CachedDataClass,
    ) {
        self.track_cached_data_at(provider, data_id, data_size, user_id, class, Utc::now())
            .await
    }

    async fn track_cached_data_at(
        &self,
        provider: &str,
        data_id: &str,
        data_size: u64,
        user_id: Option<&str>,
        class: CachedDataClass,
        now: DateTime<Utc>,
    ) {
        let retention = match class {
            CachedDataClass::Pii => self.pii_retention,
            CachedDataClass::Standard => self
                .providers
                .get(provider)
                .map(|p| Duration::hours(p.retention_hours))
                .unwrap_or_else(|| Duration::hours(24)),
        };

        let record = CachedDataRecord {
            provider: provider.to_string(),
            data_id: data_id.to_string(),
            data_size,
            user_id: user_id.map(|s| s.to_string()),
            class,
            cached_at: now,
            expires_at: now + retention,
        };

        let key = format!("{}:{}", provider, data_id);
        {
            let mut cached = self.cached.write().await;
            cached.insert(key, record);
        }

        self.audit
            .record(
                "data_cached",
                provider,
                serde_json::json!({
                    "data_id": data_id,
                    "data_size": data_size,
                    "user_id": user_id,
                    "class": class,
                }),
            )
            .await;
    }

    /// 保持期限を過ぎたキャッシュデータを削除
    ///
    /// 削除1件につき監査エントリを1件発行し、実際の保持時間を報告する。
    /// 前回のスイープが完了するまで再入しない。
    pub async fn enforce_retention(&self) -> usize {
        self.enforce_retention_at(Utc::now()).await
    }

    async fn enforce_retention_at(&self, now: DateTime<Utc>) -> usize {
        if self.sweep_in_progress.swap(true, Ordering::SeqCst) {
            tracing::warn!("retention sweep already in progress, skipping");
            return 0;
        }

        let expired: Vec<CachedDataRecord> = {
            let mut cached = self.cached.write().await;
            let keys: Vec<String> = cached
                .iter()
                .filter(|(_, record)| now > record.expires_at)
                .map(|(key, _)| key.clone())
                .collect();
            keys.iter().filter_map(|key| cached.remove(key)).collect()
        };

        for record in &expired {
            let held = now - record.cached_at;
            self.audit
                .record(
                    "data_purged",
                    &record.provider,
                    serde_json::json!({
                        "data_id": record.data_id,
                        "data_size": record.data_size,
                        "user_id": record.user_id,
                        "held_seconds": held.num_seconds(),
                    }),
                )
                .await;
        }

        let purged = expired.len();
        if purged > 0 {
            tracing::info!(purged = purged, "retention sweep removed expired cache records");
        }

        self.sweep_in_progress.store(false, Ordering::SeqCst);
        purged
    }

    /// 指定ユーザーの古いキャッシュ記録を削除（残留データ掃除）
    pub async fn purge_cached_for_user(&self, user_id: &str, cutoff: DateTime<Utc>) -> usize {
        let removed: Vec<String> = {
            let mut cached = self.cached.write().await;
            let keys: Vec<String> = cached
                .iter()
                .filter(|(_, record)| {
                    record.user_id.as_deref() == Some(user_id) && record.cached_at < cutoff
                })
                .map(|(key, _)| key.clone())
                .collect();
            for key in &keys {
                cached.remove(key);
            }
            keys
        };

        if !removed.is_empty() {
            self.audit
                .record(
                    "residual_cache_purged",
                    "internal",
                    serde_json::json!({
                        "user_id": user_id,
                        "removed": removed.len(),
                    }),
                )
                .await;
        }
        removed.len()
    }

    /// 時間カウンターをリセット（日次キーには触れない）
    pub async fn reset_hourly_counters(&self) {
        let mut counters = self.counters.lock().await;
        counters.retain(|key, _| key.ends_with(":daily"));
    }

    /// 日次カウンターをリセット（時間キーには触れない）
    pub async fn reset_daily_counters(&self) {
        let mut counters = self.counters.lock().await;
        counters.retain(|key, _| !key.ends_with(":daily"));
    }

    /// 定期メンテナンスタスクを起動
    ///
    /// 時間カウンターのリセット・日次カウンターのリセット・保持スイープを
    /// それぞれ独立したタイマーで回す。
    pub fn spawn_maintenance(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        let ledger = Arc::clone(&self);
        handles.push(tokio::spawn(async move {
            let period = std::time::Duration::from_secs(3600);
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                interval.tick().await;
                ledger.reset_hourly_counters().await;
            }
        }));

        let ledger = Arc::clone(&self);
        handles.push(tokio::spawn(async move {
            let period = std::time::Duration::from_secs(86_400);
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                interval.tick().await;
                ledger.reset_daily_counters().await;
            }
        }));

        let ledger = Arc::clone(&self);
        handles.push(tokio::spawn(async move {
            let period = std::time::Duration::from_secs(3600);
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                interval.tick().await;
                ledger.enforce_retention().await;
            }
        }));

        handles
    }

    /// 現在の時間バケットのカウント
    pub async fn hourly_count(&self, provider: &str) -> u64 {
        self.hourly_count_at(provider, Utc::now()).await
    }

    async fn hourly_count_at(&self, provider: &str, now: DateTime<Utc>) -> u64 {
        let counters = self.counters.lock().await;
        counters
            .get(&hour_bucket_key(provider, now))
            .copied()
            .unwrap_or(0)
    }

    /// 現在の日次バケットのカウント
    pub async fn daily_count(&self, provider: &str) -> u64 {
        self.daily_count_at(provider, Utc::now()).await
    }

    async fn daily_count_at(&self, provider: &str, now: DateTime<Utc>) -> u64 {
        let counters = self.counters.lock().await;
        counters
            .get(&day_bucket_key(provider, now))
            .copied()
            .unwrap_or(0)
    }

    /// 現在のキャッシュアイテム数
    pub async fn cached_item_count(&self) -> usize {
        self.cached.read().await.len()
    }

    /// 追跡したリクエスト総数（累積）
    pub fn total_tracked(&self) -> u64 {
        self.total_tracked.load(Ordering::Relaxed)
    }

    /// 拒否したリクエスト総数（累積）
    pub fn total_denied(&self) -> u64 {
        self.total_denied.load(Ordering::Relaxed)
    }
}

/// 時間バケットキー
fn hour_bucket_key(provider: &str, now: DateTime<Utc>) -> String {
    format!("{}:{}", provider, now.format("%Y-%m-%dT%H"))
}

/// 日次バケットキー
fn day_bucket_key(provider: &str, now: DateTime<Utc>) -> String {
    format!("{}:{}:daily", provider, now.format("%Y-%m-%d"))
}
