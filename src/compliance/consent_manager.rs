//! Consent Ledger (CAN-SPAM)
//!
//! 受信者×カテゴリ単位でメール送信可否を判定し、配信停止を処理する。
//! 同意の正は常に永続ストア側にあり、インメモリに持つのは
//! 配信停止セット（do-not-email）だけ。こちらはストア到達不能時にも
//! 送信を遮断するための安全装置として、ストア参照より先に評価される。

use super::audit_log::AuditLog;
use super::types::{ConsentRecord, ConsentStatus, ContentCompliance, EmailCategory, PolicyDecision};
use crate::config::ComplianceConfig;
use crate::error::Result;
use crate::store::DataStore;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

/// 送信メールに必須のワンクリック配信停止ヘッダー
///
/// 受信側メールシステムとのワイヤ契約。WebのURLと mailto: の
/// 両方を必ず併記する。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnsubscribeHeaders {
    /// List-Unsubscribe ヘッダー値
    pub list_unsubscribe: String,
    /// List-Unsubscribe-Post ヘッダー値
    pub list_unsubscribe_post: String,
}

impl UnsubscribeHeaders {
    /// ヘッダー名と値のペアとして取得
    pub fn as_header_pairs(&self) -> [(&'static str, &str); 2] {
        [
            ("List-Unsubscribe", self.list_unsubscribe.as_str()),
            ("List-Unsubscribe-Post", self.list_unsubscribe_post.as_str()),
        ]
    }
}

/// 同意台帳の統計
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsentStatistics {
    /// 記録した同意の件数（累積）
    pub consents_recorded: u64,
    /// 処理した配信停止の件数（累積）
    pub unsubscribes_processed: u64,
    /// 配信停止セットのアドレス数
    pub suppressed_addresses: usize,
}

/// 同意台帳
pub struct ConsentLedger {
    /// 永続ストア（同意の正）
    store: Arc<dyn DataStore>,
    /// 配信停止セット（全カテゴリ停止のみ登録される）
    do_not_email: Arc<RwLock<HashSet<String>>>,
    /// 監査ログ
    audit: Arc<AuditLog>,
    /// ブランド表示名
    brand_name: String,
    /// 郵送先住所
    postal_address: String,
    /// 配信停止URLのベース
    base_url: String,
    /// mailto: フォールバック
    unsubscribe_mailbox: String,
    /// 記録した同意の件数
    consents_recorded: AtomicU64,
    /// 処理した配信停止の件数
    unsubscribes_processed: AtomicU64,
}

impl ConsentLedger {
    /// 新しい同意台帳を作成
    pub fn new(config: &ComplianceConfig, store: Arc<dyn DataStore>, audit: Arc<AuditLog>) -> Self {
        Self {
            store,
            do_not_email: Arc::new(RwLock::new(HashSet::new())),
            audit,
            brand_name: config.brand_name.clone(),
            postal_address: config.postal_address.clone(),
            base_url: config.base_url.clone(),
            unsubscribe_mailbox: config.unsubscribe_mailbox.clone(),
            consents_recorded: AtomicU64::new(0),
            unsubscribes_processed: AtomicU64::new(0),
        }
    }

    /// 指定カテゴリのメールを指定アドレスに送信してよいか判定
    ///
    /// 判定順序: 配信停止セット → ストアの同意記録 → 初回接触ルール。
    /// ストア参照に失敗した場合はフェイルクローズ（拒否）する。
    /// 未承諾メールを送るリスクより、送らないリスクを取る。
    pub async fn verify_opt_in(&self, email: &str, category: EmailCategory) -> PolicyDecision {
        let email = email.to_lowercase();

        {
            let dne = self.do_not_email.read().await;
            if dne.contains(&email) {
                self.audit_block(&email, category, "recipient unsubscribed").await;
                return PolicyDecision::deny("recipient unsubscribed");
            }
        }

        match self.store.get_consent(&email).await {
            Err(e) => {
                tracing::error!(email = %email, error = %e, "consent lookup failed, failing closed");
                self.audit_block(&email, category, "verification error").await;
                PolicyDecision::deny("verification error")
            }
            Ok(None) => {
                if category.requires_explicit_consent() {
                    self.audit_block(&email, category, "no explicit consent").await;
                    PolicyDecision::deny("no explicit consent")
                } else {
                    // サービスメール: 同意記録を作らず許可
                    PolicyDecision::allow()
                }
            }
            Ok(Some(record)) => match record.category_flag(category) {
                Some(false) => {
                    self.audit_block(&email, category, "recipient opted out").await;
                    PolicyDecision::deny("recipient opted out")
                }
                // フラグ不在は許可（明示的なfalseのみ拒否）
                _ => PolicyDecision::allow(),
            },
        }
    }

    /// 同意を記録
    ///
    /// メールアドレスを自然キーとしてupsertし、重複は作らない。
    /// 同じカテゴリで繰り返し呼んでも最終状態は同じ（冪等）。
    pub async fn record_consent(
        &self,
        email: &str,
        categories: &[EmailCategory],
        consent_type: Option<ConsentStatus>,
    ) -> Result<ConsentRecord> {
        let email = email.to_lowercase();
        let now = Utc::now();

        let mut record = self
            .store
            .get_consent(&email)
            .await?
            .unwrap_or_else(|| ConsentRecord::new(&email));
        record.grant(
            categories,
            consent_type.unwrap_or(ConsentStatus::ExplicitConsent),
            now,
        );
        self.store.upsert_consent(&record).await?;

        self.consents_recorded.fetch_add(1, Ordering::Relaxed);
        self.audit
            .record(
                "consent_recorded",
                "email",
                serde_json::json!({
                    "email": email,
                    "categories": categories,
                    "consent_status": record.consent_status,
                }),
            )
            .await;

        Ok(record)
    }

    /// 配信停止を処理
    ///
    /// カテゴリ指定なしは「現在許可されているすべてからの停止」であり、
    /// アドレスを配信停止セットに登録する。セット登録が先に立つため、
    /// その後のストア書き込みに失敗しても送信は遮断される。
    /// カテゴリ指定ありは該当フラグのみ落とし、セットには登録しない。
    pub async fn process_unsubscribe(
        &self,
        email: &str,
        categories: &[EmailCategory],
        reason: Option<&str>,
    ) -> Result<()> {
        let email = email.to_lowercase();
        let now = Utc::now();

        if categories.is_empty() {
            {
                let mut dne = self.do_not_email.write().await;
                dne.insert(email.clone());
            }

            let mut record = match self.store.get_consent(&email).await {
                Ok(Some(record)) => record,
                Ok(None) => ConsentRecord::new(&email),
                Err(e) => {
                    tracing::error!(email = %email, error = %e, "consent lookup failed during unsubscribe");
                    ConsentRecord::new(&email)
                }
            };
            record.revoke_all(reason.map(|s| s.to_string()), now);

            if let Err(e) = self.store.upsert_consent(&record).await {
                // セット登録済みのため遮断は既に効いている
                tracing::error!(email = %email, error = %e, "failed to persist full unsubscribe");
            }
        } else {
            let mut record = self
                .store
                .get_consent(&email)
                .await?
                .unwrap_or_else(|| ConsentRecord::new(&email));
            record.revoke(categories, reason.map(|s| s.to_string()), now);
            self.store.upsert_consent(&record).await?;
        }

        self.unsubscribes_processed.fetch_add(1, Ordering::Relaxed);
        self.audit
            .record(
                "unsubscribe_processed",
                "email",
                serde_json::json!({
                    "email": email,
                    "scope": if categories.is_empty() { "all".to_string() } else { format!("{:?}", categories) },
                }),
            )
            .await;

        Ok(())
    }

    /// メール本文のCAN-SPAM検証
    ///
    /// 文字列の包含チェックによる静的検証であり、HTMLパーサーではない。
    pub fn validate_content(&self, body: &str, category: EmailCategory) -> ContentCompliance {
        let mut issues = Vec::new();
        let body_lower = body.to_lowercase();

        if category.requires_explicit_consent() && !body.contains(&self.brand_name) {
            issues.push(format!(
                "promotional content must identify the sender brand '{}'",
                self.brand_name
            ));
        }

        if !body.contains(&self.postal_address) {
            issues.push("missing postal address footer".to_string());
        }

        if !body_lower.contains("unsubscribe") {
            issues.push("missing unsubscribe mechanism reference".to_string());
        }

        ContentCompliance {
            compliant: issues.is_empty(),
            issues,
        }
    }

    /// ワンクリック配信停止ヘッダーを生成
    pub fn unsubscribe_headers(&self, email: &str) -> UnsubscribeHeaders {
        let email = email.to_lowercase();
        let encoded = urlencoding::encode(&email);
        UnsubscribeHeaders {
            list_unsubscribe: format!(
                "<{}/unsubscribe?email={}>, <mailto:{}?subject=unsubscribe>",
                self.base_url, encoded, self.unsubscribe_mailbox
            ),
            list_unsubscribe_post: "List-Unsubscribe=One-Click".to_string(),
        }
    }

    /// アドレスが配信停止セットに含まれるか
    pub async fn is_suppressed(&self, email: &str) -> bool {
        let dne = self.do_not_email.read().await;
        dne.contains(&email.to_lowercase())
    }

    /// 統計を取得
    pub async fn get_statistics(&self) -> ConsentStatistics {
        ConsentStatistics {
            consents_recorded: self.consents_recorded.load(Ordering::Relaxed),
            unsubscribes_processed: self.unsubscribes_processed.load(Ordering::Relaxed),
            suppressed_addresses: self.do_not_email.read().await.len(),
        }
    }

    async fn audit_block(&self, email: &str, category: EmailCategory, reason: &str) {
        self.audit
            .record(
                "email_blocked",
                "email",
                serde_json::json!({
                    "email": email,
                    "category": category,
                    "reason": reason,
                }),
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn test_ledger() -> (ConsentLedger, Arc<MemoryStore>, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir failed");
        let audit = Arc::new(AuditLog::new(dir.path().to_path_buf()));
        let store = Arc::new(MemoryStore::new());
        let ledger = ConsentLedger::new(
            &ComplianceConfig::default(),
            Arc::clone(&store) as Arc<dyn DataStore>,
            audit,
        );
        (ledger, store, dir)
    }

    #[tokio::test]
    async fn test_service_email_allowed_without_record() {
        let (ledger, store, _dir) = test_ledger();

        for category in [
            EmailCategory::Transactional,
            EmailCategory::Security,
            EmailCategory::Account,
        ] {
            let decision = ledger.verify_opt_in("new@example.com", category).await;
            assert!(decision.allowed, "{} should be allowed", category);
        }

        // 副作用として同意記録は作られない
        let record = store.get_consent("new@example.com").await.expect("lookup failed");
        assert!(record.is_none());
    }

    #[tokio::test]
    async fn test_first_contact_marketing_requires_consent() {
        let (ledger, _store, _dir) = test_ledger();

        for category in [
            EmailCategory::Marketing,
            EmailCategory::Promotional,
            EmailCategory::Waitlist,
        ] {
            let decision = ledger.verify_opt_in("new@example.com", category).await;
            assert!(!decision.allowed);
            assert_eq!(decision.reason.as_deref(), Some("no explicit consent"));
        }
    }

    #[tokio::test]
    async fn test_consent_roundtrip() {
        let (ledger, _store, _dir) = test_ledger();
        let email = "user@example.com";

        ledger
            .record_consent(email, &[EmailCategory::Marketing], None)
            .await
            .expect("record failed");
        let decision = ledger.verify_opt_in(email, EmailCategory::Marketing).await;
        assert!(decision.allowed);

        ledger
            .process_unsubscribe(email, &[EmailCategory::Marketing], None)
            .await
            .expect("unsubscribe failed");
        let decision = ledger.verify_opt_in(email, EmailCategory::Marketing).await;
        assert!(!decision.allowed);
        assert_eq!(decision.reason.as_deref(), Some("recipient opted out"));
    }

    #[tokio::test]
    async fn test_scoped_unsubscribe_keeps_service_email() {
        let (ledger, _store, _dir) = test_ledger();
        let email = "user@example.com";

        ledger
            .record_consent(email, &[EmailCategory::Marketing], None)
            .await
            .expect("record failed");
        ledger
            .process_unsubscribe(email, &[EmailCategory::Marketing], None)
            .await
            .expect("unsubscribe failed");

        // カテゴリ限定の停止はサービスメールを遮断しない
        let decision = ledger
            .verify_opt_in(email, EmailCategory::Transactional)
            .await;
        assert!(decision.allowed);

        let decision = ledger.verify_opt_in(email, EmailCategory::Marketing).await;
        assert!(!decision.allowed);
    }

    #[tokio::test]
    async fn test_full_unsubscribe_blocks_everything() {
        let (ledger, _store, _dir) = test_ledger();
        let email = "User@Example.com";

        ledger
            .record_consent(email, &[EmailCategory::Marketing], None)
            .await
            .expect("record failed");
        ledger
            .process_unsubscribe(email, &[], Some("too many emails"))
            .await
            .expect("unsubscribe failed");

        // 事前の同意があっても配信停止セットが優先される
        let decision = ledger.verify_opt_in(email, EmailCategory::Marketing).await;
        assert!(!decision.allowed);
        assert_eq!(decision.reason.as_deref(), Some("recipient unsubscribed"));

        let decision = ledger
            .verify_opt_in(email, EmailCategory::Transactional)
            .await;
        assert!(!decision.allowed);
        assert_eq!(decision.reason.as_deref(), Some("recipient unsubscribed"));
    }

    #[tokio::test]
    async fn test_verify_fails_closed_on_store_error() {
        let (ledger, store, _dir) = test_ledger();

        store.set_fail_consent_reads(true);
        let decision = ledger
            .verify_opt_in("user@example.com", EmailCategory::Transactional)
            .await;
        assert!(!decision.allowed);
        assert_eq!(decision.reason.as_deref(), Some("verification error"));
    }

    #[tokio::test]
    async fn test_suppression_set_precedes_store() {
        let (ledger, store, _dir) = test_ledger();
        let email = "user@example.com";

        ledger
            .process_unsubscribe(email, &[], None)
            .await
            .expect("unsubscribe failed");

        // ストアが落ちていても配信停止セットで遮断される
        store.set_fail_consent_reads(true);
        let decision = ledger.verify_opt_in(email, EmailCategory::Marketing).await;
        assert!(!decision.allowed);
        assert_eq!(decision.reason.as_deref(), Some("recipient unsubscribed"));
    }

    #[tokio::test]
    async fn test_validate_content() {
        let (ledger, _store, _dir) = test_ledger();
        let config = ComplianceConfig::default();

        let compliant_body = format!(
            "Fresh deals this week from 3C Mall!\n\nTo stop receiving these, unsubscribe here.\n{}",
            config.postal_address
        );
        let result = ledger.validate_content(&compliant_body, EmailCategory::Promotional);
        assert!(result.compliant, "issues: {:?}", result.issues);

        let bare_body = "Fresh deals this week!";
        let result = ledger.validate_content(bare_body, EmailCategory::Promotional);
        assert!(!result.compliant);
        assert_eq!(result.issues.len(), 3);

        // トランザクションメールにブランド表記は必須ではない
        let service_body = format!(
            "Your order has shipped.\nManage preferences or unsubscribe.\n{}",
            config.postal_address
        );
        let result = ledger.validate_content(&service_body, EmailCategory::Transactional);
        assert!(result.compliant, "issues: {:?}", result.issues);
    }

    #[tokio::test]
    async fn test_unsubscribe_headers_wire_contract() {
        let (ledger, _store, _dir) = test_ledger();

        let headers = ledger.unsubscribe_headers("User@Example.com");
        assert!(headers.list_unsubscribe.contains("<https://3cmall.app/unsubscribe?email=user%40example.com>"));
        assert!(headers.list_unsubscribe.contains("<mailto:unsubscribe@3cmall.app?subject=unsubscribe>"));
        assert_eq!(headers.list_unsubscribe_post, "List-Unsubscribe=One-Click");

        let pairs = headers.as_header_pairs();
        assert_eq!(pairs[0].0, "List-Unsubscribe");
        assert_eq!(pairs[1].0, "List-Unsubscribe-Post");
    }
}
