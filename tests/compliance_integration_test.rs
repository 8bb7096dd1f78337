//! Compliance Core Integration Tests
//!
//! ポリシーファサード経由のエンドツーエンドシナリオ

use chrono::{Duration, Utc};
use mall_compliance::compliance::types::*;
use mall_compliance::compliance::{BreachNotifyOutcome, ComplianceEngine};
use mall_compliance::config::ComplianceConfig;
use mall_compliance::store::{DataDomain, DataStore, MemoryStore};
use std::sync::Arc;

fn test_engine() -> (ComplianceEngine, Arc<MemoryStore>, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir failed");
    let mut config = ComplianceConfig::default();
    config.log_dir = dir.path().join("logs");
    config.export_dir = dir.path().join("exports");

    let store = Arc::new(MemoryStore::new());
    let engine = ComplianceEngine::new(config, Arc::clone(&store) as Arc<dyn DataStore>);
    (engine, store, dir)
}

// シナリオA: KROGER は 300/min 設定 → 時間上限 18,000。
// 同一時間バケット内の 18,001 回目だけが時間上限で拒否される。
#[tokio::test]
async fn test_scenario_a_hourly_ceiling() {
    let (engine, _store, _dir) = test_engine();

    let mut allowed = 0u64;
    let mut denied = Vec::new();
    for _ in 0..18_001 {
        let decision = engine
            .track_api_request("KROGER", "/v1/products/search", Some("u-1"))
            .await;
        if decision.allowed {
            allowed += 1;
        } else {
            denied.push(decision);
        }
    }

    assert_eq!(allowed, 18_000);
    assert_eq!(denied.len(), 1);
    assert_eq!(
        denied[0].reason.as_deref(),
        Some("hourly rate limit exceeded")
    );

    let report = engine.get_compliance_report(None, None).await;
    assert_eq!(report.statistics.total_requests_tracked, 18_000);
    assert_eq!(report.statistics.total_requests_denied, 1);
    assert_eq!(
        report.recent_violations[0].violation_type,
        ViolationType::RateLimitMinute
    );
}

// シナリオB: 深刻度 high のインシデント → 通知期限は発見時刻+48時間ちょうど。
// 10時間後の通知で notified に遷移し、resolved は false のまま。
#[tokio::test]
async fn test_scenario_b_breach_notification_window() {
    let (engine, _store, _dir) = test_engine();

    let breach = engine
        .report_security_breach(
            "credential_exposure",
            "partner API key found in client bundle",
            vec!["u-1".to_string(), "u-2".to_string(), "u-3".to_string()],
            BreachSeverity::High,
        )
        .await;

    assert_eq!(
        breach.notification_deadline,
        breach.discovered_at + Duration::hours(48)
    );
    assert_eq!(breach.status, BreachStatus::PendingNotification);

    let outcome = engine.mark_breach_notified(&breach.id, "email").await;
    assert_eq!(outcome, BreachNotifyOutcome::Notified);

    let stored = engine
        .audit_log()
        .get_breach(&breach.id)
        .await
        .expect("breach missing");
    assert_eq!(stored.status, BreachStatus::Notified);
    assert!(stored.notified_at.is_some());
    assert!(!stored.resolved);

    let report = engine.get_compliance_report(None, None).await;
    assert_eq!(report.statistics.breach_count, 1);
    assert_eq!(report.statistics.unresolved_breaches, 1);
}

// シナリオC: marketing のみ配信停止したアドレスは、transactional には
// 引き続き送信できるが marketing には送信できない。
#[tokio::test]
async fn test_scenario_c_category_scoped_unsubscribe() {
    let (engine, _store, _dir) = test_engine();
    let email = "user@example.com";

    engine
        .record_consent(email, &[EmailCategory::Marketing], None)
        .await
        .expect("consent failed");
    engine
        .process_unsubscribe(email, &[EmailCategory::Marketing], None)
        .await
        .expect("unsubscribe failed");

    let decision = engine
        .verify_opt_in(email, EmailCategory::Transactional)
        .await;
    assert!(decision.allowed);

    let decision = engine.verify_opt_in(email, EmailCategory::Marketing).await;
    assert!(!decision.allowed);
}

#[tokio::test]
async fn test_unknown_provider_is_hard_failure() {
    let (engine, _store, _dir) = test_engine();

    let decision = engine.track_api_request("ACME", "/v1/items", None).await;
    assert!(!decision.allowed);
    assert_eq!(decision.reason.as_deref(), Some("unknown provider"));

    let report = engine.get_compliance_report(None, None).await;
    let unknown: Vec<_> = report
        .recent_violations
        .iter()
        .filter(|v| v.violation_type == ViolationType::UnknownProvider)
        .collect();
    assert_eq!(unknown.len(), 1);
}

#[tokio::test]
async fn test_consent_roundtrip_through_facade() {
    let (engine, _store, _dir) = test_engine();
    let email = "shopper@example.com";

    // 初回接触のマーケティングは明示的同意がないため拒否
    let decision = engine.verify_opt_in(email, EmailCategory::Marketing).await;
    assert!(!decision.allowed);
    assert_eq!(decision.reason.as_deref(), Some("no explicit consent"));

    let receipt = engine
        .record_consent(email, &[EmailCategory::Marketing], Some(ConsentStatus::ExplicitConsent))
        .await
        .expect("consent failed");
    assert!(receipt.recorded);

    let decision = engine.verify_opt_in(email, EmailCategory::Marketing).await;
    assert!(decision.allowed);

    // 全停止は事前の同意より優先される
    engine
        .process_unsubscribe(email, &[], Some("no longer interested"))
        .await
        .expect("unsubscribe failed");
    let decision = engine.verify_opt_in(email, EmailCategory::Marketing).await;
    assert!(!decision.allowed);
    assert_eq!(decision.reason.as_deref(), Some("recipient unsubscribed"));
}

#[tokio::test]
async fn test_export_bundle_is_scrubbed() {
    let (engine, store, _dir) = test_engine();

    store
        .seed_rows(
            DataDomain::Profile,
            "u-9",
            vec![serde_json::json!({
                "id": "u-9",
                "email": "sam@example.com",
                "password": "hunter2",
                "api_key": "sk_live_secret",
                "stripe_customer_id": "cus_123",
            })],
        )
        .await;
    store
        .seed_rows(
            DataDomain::Preferences,
            "u-9",
            vec![serde_json::json!({"theme": "dark", "token": "abc"})],
        )
        .await;

    let receipt = engine
        .request_data_export("u-9", "sam@example.com")
        .await
        .expect("export failed");
    assert!(receipt.success);
    assert!(receipt.expires_at - Utc::now() > Duration::days(6));

    let bundle = engine
        .get_data_export(&receipt.export_id)
        .await
        .expect("get failed");
    let serialized = serde_json::to_string(&bundle).expect("serialize failed");
    for key in ["\"password\"", "\"secret\"", "\"token\"", "\"api_key\"", "\"stripe_customer_id\""] {
        assert!(!serialized.contains(key), "{} leaked into export", key);
    }

    // 未知のIDは not found or expired
    assert!(engine.get_data_export("missing-id").await.is_err());
}

#[tokio::test]
async fn test_account_deletion_end_to_end() {
    let (engine, store, _dir) = test_engine();

    store
        .seed_rows(DataDomain::Profile, "u-5", vec![serde_json::json!({"id": "u-5"})])
        .await;
    store
        .seed_rows(
            DataDomain::Recipes,
            "u-5",
            vec![serde_json::json!({"title": "ramen"}), serde_json::json!({"title": "pho"})],
        )
        .await;

    let receipt = engine
        .request_account_deletion("u-5", "leaver@example.com", Some("moving on".to_string()))
        .await
        .expect("request failed");
    assert!(receipt.success);
    assert!(receipt.verification_url.contains(&receipt.deletion_id));

    // 確認前はデータに触れない
    assert_eq!(store.row_count(DataDomain::Recipes, "u-5").await, 2);

    let confirmation = engine
        .confirm_account_deletion(&receipt.deletion_id)
        .await
        .expect("confirm failed");
    assert!(confirmation.success);
    assert_eq!(store.row_count(DataDomain::Recipes, "u-5").await, 0);
    assert_eq!(store.row_count(DataDomain::Profile, "u-5").await, 0);

    let status = engine
        .get_deletion_status(&receipt.deletion_id)
        .await
        .expect("status missing");
    assert_eq!(status.status, DeletionStatus::Completed);
    assert!(status.deleted_at.is_some());

    // 完了済みへの再確認はエラーであり、完了監査エントリも増えない
    let completion_entries = engine
        .audit_log()
        .recent_entries(100)
        .await
        .into_iter()
        .filter(|e| e.event_type == "account_deleted")
        .count();
    assert_eq!(completion_entries, 1);

    let err = engine
        .confirm_account_deletion(&receipt.deletion_id)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("Invalid request state"));

    let completion_entries_after = engine
        .audit_log()
        .recent_entries(100)
        .await
        .into_iter()
        .filter(|e| e.event_type == "account_deleted")
        .count();
    assert_eq!(completion_entries_after, 1);

    // 未知の削除IDの照会は not found（None）
    assert!(engine.get_deletion_status("del_ghost_1").await.is_none());
}

#[tokio::test]
async fn test_durable_logs_are_partitioned_by_category() {
    let (engine, _store, dir) = test_engine();

    engine.track_api_request("KROGER", "/v1/products", None).await;
    engine.track_api_request("ACME", "/v1/products", None).await;
    engine
        .report_security_breach("test", "incident", vec![], BreachSeverity::Low)
        .await;

    let log_dir = dir.path().join("logs");
    assert!(log_dir.join("audit.log").exists());
    assert!(log_dir.join("violations.log").exists());
    assert!(log_dir.join("security-incidents.log").exists());

    // 各行は ISO-8601 タイムスタンプ + JSON
    let content = std::fs::read_to_string(log_dir.join("violations.log")).expect("read failed");
    for line in content.lines() {
        let (ts, json) = line.split_once(' ').expect("malformed line");
        assert!(chrono::DateTime::parse_from_rfc3339(ts).is_ok());
        assert!(serde_json::from_str::<serde_json::Value>(json).is_ok());
    }
}

#[tokio::test]
async fn test_residual_cleanup_is_best_effort() {
    let (engine, _store, _dir) = test_engine();

    engine
        .track_cached_data("KROGER", "prod-1", 512, Some("u-1"), CachedDataClass::Standard)
        .await;
    engine
        .request_data_export("u-1", "user@example.com")
        .await
        .expect("export failed");

    // 0日指定: ユーザーのキャッシュ記録と成果物がすべて対象になる
    let cleanup = engine.cleanup_residual_data("u-1", 0).await;
    assert_eq!(cleanup.cache_records_removed, 1);
    assert_eq!(cleanup.artifacts_removed, 1);
}

#[tokio::test]
async fn test_unsubscribe_headers_roundtrip() {
    let (engine, _store, _dir) = test_engine();

    let headers = engine.unsubscribe_headers("Shopper@Example.com");
    assert!(headers.list_unsubscribe.contains("https://"));
    assert!(headers.list_unsubscribe.contains("mailto:"));
    assert_eq!(headers.list_unsubscribe_post, "List-Unsubscribe=One-Click");

    let body = format!(
        "This week at 3C Mall: fresh produce deals.\nunsubscribe anytime.\n{}",
        ComplianceConfig::default().postal_address
    );
    let result = engine.validate_email_content(&body, EmailCategory::Promotional);
    assert!(result.compliant, "issues: {:?}", result.issues);
}
