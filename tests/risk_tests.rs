// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Device assessment, risk scoring and the security event log.

use identity_gateway::db::{CredentialStore, MemoryStore, SharedStore};
use identity_gateway::error::AppError;
use identity_gateway::models::{SecurityEventType, Severity, User};
use identity_gateway::services::{NewSecurityEvent, RiskService};
use std::sync::Arc;
use uuid::Uuid;

const LAPTOP: &str = "fp-laptop-0001";

async fn setup() -> (RiskService, SharedStore, Uuid) {
    let store: SharedStore = Arc::new(MemoryStore::new());
    let user_id = seed_user(&store, "alice").await;
    (RiskService::new(store.clone()), store, user_id)
}

async fn seed_user(store: &SharedStore, name: &str) -> Uuid {
    store
        .insert_user(User::new(
            format!("idp|{}", name),
            format!("{}@example.com", name),
            name,
        ))
        .await
        .unwrap()
        .id
}

fn ip(addr: &str) -> Option<String> {
    Some(addr.to_string())
}

async fn count_events(risk: &RiskService, user_id: Uuid, kind: SecurityEventType) -> usize {
    risk.list_events(user_id, false)
        .await
        .unwrap()
        .iter()
        .filter(|e| e.event_type == kind)
        .count()
}

#[tokio::test]
async fn test_first_sight_of_device() {
    let (risk, _, user_id) = setup().await;

    let assessment = risk
        .assess_device(user_id, LAPTOP, ip("198.51.100.1"), None)
        .await
        .unwrap();

    assert!(assessment.device_id.is_some());
    assert!(!assessment.trusted);
    assert_eq!(assessment.risk_score, 4.0);
    assert_eq!(assessment.severity, Severity::Medium);
    assert_eq!(count_events(&risk, user_id, SecurityEventType::NewDevice).await, 1);
    assert_eq!(risk.list_devices(user_id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_known_device_scoring() {
    let (risk, _, user_id) = setup().await;
    let first = risk
        .assess_device(user_id, LAPTOP, ip("198.51.100.1"), None)
        .await
        .unwrap();

    // Same device, same address: only the untrusted weight.
    let again = risk
        .assess_device(user_id, LAPTOP, ip("198.51.100.1"), None)
        .await
        .unwrap();
    assert_eq!(again.device_id, first.device_id);
    assert_eq!(again.risk_score, 2.5);
    assert_eq!(again.severity, Severity::Low);

    // New address adds the location weight and an audit entry.
    let moved = risk
        .assess_device(user_id, LAPTOP, ip("203.0.113.50"), None)
        .await
        .unwrap();
    assert_eq!(moved.risk_score, 4.0);
    assert_eq!(
        count_events(&risk, user_id, SecurityEventType::SuspiciousLocation).await,
        1
    );
    assert_eq!(count_events(&risk, user_id, SecurityEventType::NewDevice).await, 1);
}

#[tokio::test]
async fn test_trusted_device_scores_zero() {
    let (risk, _, user_id) = setup().await;
    let device_id = risk
        .assess_device(user_id, LAPTOP, ip("198.51.100.1"), None)
        .await
        .unwrap()
        .device_id
        .unwrap();

    let device = risk.trust_device(user_id, device_id).await.unwrap();
    assert!(device.trusted);

    let assessment = risk
        .assess_device(user_id, LAPTOP, ip("198.51.100.1"), None)
        .await
        .unwrap();
    assert!(assessment.trusted);
    assert_eq!(assessment.risk_score, 0.0);

    risk.untrust_device(user_id, device_id).await.unwrap();
    let assessment = risk
        .assess_device(user_id, LAPTOP, ip("198.51.100.1"), None)
        .await
        .unwrap();
    assert!(!assessment.trusted);
}

#[tokio::test]
async fn test_foreign_fingerprint_is_high_severity() {
    let (risk, store, alice) = setup().await;
    let bob = seed_user(&store, "bob").await;
    risk.assess_device(alice, LAPTOP, ip("198.51.100.1"), None)
        .await
        .unwrap();

    let assessment = risk
        .assess_device(bob, LAPTOP, ip("198.51.100.1"), None)
        .await
        .unwrap();
    assert!(assessment.device_id.is_none());
    assert!(assessment.severity >= Severity::High);
    assert_eq!(assessment.risk_score, 7.0);

    // The device stays registered to its first owner.
    assert!(risk.list_devices(bob).await.unwrap().is_empty());
    let events = risk.list_events(bob, false).await.unwrap();
    assert_eq!(events.len(), 1);
    assert!(events[0].severity >= Severity::High);
}

#[tokio::test]
async fn test_failed_mfa_raises_score() {
    let (risk, _, user_id) = setup().await;
    for _ in 0..2 {
        risk.record_event(NewSecurityEvent::new(user_id, SecurityEventType::FailedMfa))
            .await
            .unwrap();
    }

    let assessment = risk
        .assess_device(user_id, LAPTOP, None, None)
        .await
        .unwrap();
    assert_eq!(assessment.risk_score, 6.0);
    assert_eq!(assessment.severity, Severity::High);
}

#[tokio::test]
async fn test_device_trust_is_owner_only() {
    let (risk, store, alice) = setup().await;
    let bob = seed_user(&store, "bob").await;
    let device_id = risk
        .assess_device(alice, LAPTOP, None, None)
        .await
        .unwrap()
        .device_id
        .unwrap();

    assert!(matches!(
        risk.trust_device(bob, device_id).await,
        Err(AppError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_event_severity_defaults_to_score_band() {
    let (risk, _, user_id) = setup().await;

    let low = risk
        .record_event(NewSecurityEvent::new(user_id, SecurityEventType::Login))
        .await
        .unwrap();
    assert_eq!(low.severity, Severity::Low);

    let critical = risk
        .record_event(NewSecurityEvent::new(user_id, SecurityEventType::Login).with_score(42.0))
        .await
        .unwrap();
    assert_eq!(critical.risk_score, 10.0);
    assert_eq!(critical.severity, Severity::Critical);

    let forced = risk
        .record_event(
            NewSecurityEvent::new(user_id, SecurityEventType::ConnectionError)
                .with_severity(Severity::Medium),
        )
        .await
        .unwrap();
    assert_eq!(forced.severity, Severity::Medium);
}

#[tokio::test]
async fn test_resolve_events() {
    let (risk, store, alice) = setup().await;
    let bob = seed_user(&store, "bob").await;
    let event = risk
        .record_event(NewSecurityEvent::new(alice, SecurityEventType::NewDevice).with_score(4.0))
        .await
        .unwrap();
    risk.record_event(NewSecurityEvent::new(alice, SecurityEventType::Login))
        .await
        .unwrap();

    assert_eq!(risk.list_events(alice, true).await.unwrap().len(), 2);

    assert!(matches!(
        risk.resolve_for_user(bob, event.id).await,
        Err(AppError::NotFound(_))
    ));

    let resolved = risk.resolve_for_user(alice, event.id).await.unwrap();
    assert!(resolved.resolved);
    let first_resolved_at = resolved.resolved_at.unwrap();

    let again = risk.resolve(event.id).await.unwrap();
    assert_eq!(again.resolved_at, Some(first_resolved_at));

    let open = risk.list_events(alice, true).await.unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].event_type, SecurityEventType::Login);

    assert!(matches!(
        risk.resolve(Uuid::new_v4()).await,
        Err(AppError::NotFound(_))
    ));
}
