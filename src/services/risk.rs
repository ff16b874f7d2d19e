// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Security event log, device trust and risk scoring.

use chrono::{Duration, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::db::SharedStore;
use crate::error::{AppError, Result};
use crate::models::{SecurityEvent, SecurityEventType, Severity, TrustedDevice};

pub const MAX_RISK_SCORE: f64 = 10.0;

const NEW_DEVICE_WEIGHT: f64 = 4.0;
const UNTRUSTED_DEVICE_WEIGHT: f64 = 2.5;
const IP_CHANGE_WEIGHT: f64 = 1.5;
const FOREIGN_FINGERPRINT_WEIGHT: f64 = 3.0;
const FAILED_MFA_WEIGHT: f64 = 1.0;
const FAILED_MFA_CAP: usize = 3;

/// Inputs to [`risk_score`].
#[derive(Debug, Clone, Copy, Default)]
pub struct RiskSignals {
    pub new_device: bool,
    pub known_untrusted: bool,
    pub ip_changed: bool,
    /// Fingerprint already registered to a different user
    pub foreign_fingerprint: bool,
    /// Failed MFA attempts in the last 24 hours
    pub recent_failed_mfa: usize,
}

/// Weighted sum of the signals, clamped to `0..=10`.
pub fn risk_score(signals: &RiskSignals) -> f64 {
    let mut score = 0.0;
    if signals.new_device {
        score += NEW_DEVICE_WEIGHT;
    }
    if signals.known_untrusted {
        score += UNTRUSTED_DEVICE_WEIGHT;
    }
    if signals.ip_changed {
        score += IP_CHANGE_WEIGHT;
    }
    if signals.foreign_fingerprint {
        score += FOREIGN_FINGERPRINT_WEIGHT;
    }
    score += FAILED_MFA_WEIGHT * signals.recent_failed_mfa.min(FAILED_MFA_CAP) as f64;
    score.clamp(0.0, MAX_RISK_SCORE)
}

/// An event to append. Severity defaults to the band of `risk_score`.
#[derive(Debug, Clone)]
pub struct NewSecurityEvent {
    pub user_id: Uuid,
    pub event_type: SecurityEventType,
    pub connection_id: Option<Uuid>,
    pub severity: Option<Severity>,
    pub risk_score: f64,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub details: Option<String>,
}

impl NewSecurityEvent {
    pub fn new(user_id: Uuid, event_type: SecurityEventType) -> Self {
        Self {
            user_id,
            event_type,
            connection_id: None,
            severity: None,
            risk_score: 0.0,
            ip_address: None,
            user_agent: None,
            details: None,
        }
    }

    pub fn with_score(mut self, score: f64) -> Self {
        self.risk_score = score.clamp(0.0, MAX_RISK_SCORE);
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = Some(severity);
        self
    }

    pub fn with_client(mut self, ip_address: Option<String>, user_agent: Option<String>) -> Self {
        self.ip_address = ip_address;
        self.user_agent = user_agent;
        self
    }

    pub fn with_connection(mut self, connection_id: Uuid) -> Self {
        self.connection_id = Some(connection_id);
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// Outcome of looking at the device a request comes from.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceAssessment {
    /// `None` when the fingerprint belongs to someone else
    pub device_id: Option<Uuid>,
    pub trusted: bool,
    pub risk_score: f64,
    pub severity: Severity,
}

pub struct RiskService {
    store: SharedStore,
}

impl RiskService {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    /// Append an event to the audit log.
    pub async fn record_event(&self, event: NewSecurityEvent) -> Result<SecurityEvent> {
        let severity = event
            .severity
            .unwrap_or_else(|| Severity::from_score(event.risk_score));
        let record = SecurityEvent {
            id: Uuid::new_v4(),
            user_id: event.user_id,
            connection_id: event.connection_id,
            event_type: event.event_type,
            severity,
            risk_score: event.risk_score,
            ip_address: event.ip_address,
            user_agent: event.user_agent,
            details: event.details,
            resolved: false,
            resolved_at: None,
            created_at: Utc::now(),
            deleted_at: None,
        };
        self.store.insert_security_event(record.clone()).await?;

        if severity >= Severity::High {
            tracing::warn!(
                user_id = %record.user_id,
                event_type = ?record.event_type,
                severity = ?severity,
                risk_score = record.risk_score,
                "Security event recorded"
            );
        } else {
            tracing::info!(
                user_id = %record.user_id,
                event_type = ?record.event_type,
                severity = ?severity,
                "Security event recorded"
            );
        }
        Ok(record)
    }

    /// Record an event without failing the caller.
    pub async fn record_event_quietly(&self, event: NewSecurityEvent) {
        let event_type = event.event_type;
        if let Err(e) = self.record_event(event).await {
            tracing::warn!(error = %e, event_type = ?event_type, "Failed to record security event");
        }
    }

    /// Mark an event resolved. Resolving twice keeps the first timestamp.
    pub async fn resolve(&self, event_id: Uuid) -> Result<SecurityEvent> {
        self.store
            .resolve_security_event(event_id, Utc::now())
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Security event {}", event_id)))
    }

    /// [`Self::resolve`], restricted to the user's own events.
    pub async fn resolve_for_user(&self, user_id: Uuid, event_id: Uuid) -> Result<SecurityEvent> {
        match self.store.get_security_event(event_id).await? {
            Some(event) if event.user_id == user_id => self.resolve(event_id).await,
            _ => Err(AppError::NotFound(format!("Security event {}", event_id))),
        }
    }

    pub async fn list_events(&self, user_id: Uuid, unresolved_only: bool) -> Result<Vec<SecurityEvent>> {
        Ok(self
            .store
            .list_security_events(user_id)
            .await?
            .into_iter()
            .filter(|e| !unresolved_only || !e.resolved)
            .collect())
    }

    /// Score the device behind a request and keep the device table current.
    pub async fn assess_device(
        &self,
        user_id: Uuid,
        fingerprint: &str,
        ip_address: Option<String>,
        user_agent: Option<String>,
    ) -> Result<DeviceAssessment> {
        let now = Utc::now();
        let recent_failed_mfa = self
            .store
            .count_security_events_since(user_id, SecurityEventType::FailedMfa, now - Duration::hours(24))
            .await?;
        let mut signals = RiskSignals {
            recent_failed_mfa,
            ..Default::default()
        };

        let existing = match self.store.get_device_by_fingerprint(fingerprint).await? {
            Some(device) => Some(device),
            None => {
                let device =
                    TrustedDevice::new(user_id, fingerprint, ip_address.clone(), user_agent.clone());
                match self.store.insert_device(device.clone()).await {
                    Ok(()) => {
                        signals.new_device = true;
                        return self
                            .finish_new_device(user_id, device.id, signals, ip_address, user_agent)
                            .await;
                    }
                    // Lost an insert race; score against the winner's row.
                    Err(AppError::Conflict(_)) => {
                        self.store.get_device_by_fingerprint(fingerprint).await?
                    }
                    Err(e) => return Err(e),
                }
            }
        };

        let Some(device) = existing else {
            return Err(AppError::Database(format!(
                "Device {} vanished during assessment",
                fingerprint
            )));
        };

        if device.user_id != user_id {
            signals.new_device = true;
            signals.foreign_fingerprint = true;
            let score = risk_score(&signals);
            let severity = Severity::from_score(score).max(Severity::High);
            self.record_event(
                NewSecurityEvent::new(user_id, SecurityEventType::NewDevice)
                    .with_score(score)
                    .with_severity(severity)
                    .with_client(ip_address, user_agent)
                    .with_details("Device fingerprint registered to another account"),
            )
            .await?;
            return Ok(DeviceAssessment {
                device_id: None,
                trusted: false,
                risk_score: score,
                severity,
            });
        }

        signals.known_untrusted = !device.trusted;
        signals.ip_changed = match (&device.last_ip, &ip_address) {
            (Some(last), Some(current)) => last != current,
            _ => false,
        };
        let score = risk_score(&signals);
        let severity = Severity::from_score(score);

        self.store
            .touch_device(device.id, ip_address.clone(), now)
            .await?;

        if signals.ip_changed {
            self.record_event(
                NewSecurityEvent::new(user_id, SecurityEventType::SuspiciousLocation)
                    .with_score(score)
                    .with_client(ip_address, user_agent)
                    .with_details(format!(
                        "Known device seen from a new address (was {})",
                        device.last_ip.as_deref().unwrap_or("unknown")
                    )),
            )
            .await?;
        }

        Ok(DeviceAssessment {
            device_id: Some(device.id),
            trusted: device.trusted,
            risk_score: score,
            severity,
        })
    }

    async fn finish_new_device(
        &self,
        user_id: Uuid,
        device_id: Uuid,
        signals: RiskSignals,
        ip_address: Option<String>,
        user_agent: Option<String>,
    ) -> Result<DeviceAssessment> {
        let score = risk_score(&signals);
        let severity = Severity::from_score(score);
        self.record_event(
            NewSecurityEvent::new(user_id, SecurityEventType::NewDevice)
                .with_score(score)
                .with_client(ip_address, user_agent),
        )
        .await?;
        Ok(DeviceAssessment {
            device_id: Some(device_id),
            trusted: false,
            risk_score: score,
            severity,
        })
    }

    pub async fn trust_device(&self, user_id: Uuid, device_id: Uuid) -> Result<TrustedDevice> {
        self.set_trusted(user_id, device_id, true).await
    }

    pub async fn untrust_device(&self, user_id: Uuid, device_id: Uuid) -> Result<TrustedDevice> {
        self.set_trusted(user_id, device_id, false).await
    }

    async fn set_trusted(&self, user_id: Uuid, device_id: Uuid, trusted: bool) -> Result<TrustedDevice> {
        let device = self
            .store
            .set_device_trusted(user_id, device_id, trusted)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Device {}", device_id)))?;
        tracing::info!(user_id = %user_id, device_id = %device_id, trusted, "Device trust changed");
        Ok(device)
    }

    pub async fn list_devices(&self, user_id: Uuid) -> Result<Vec<TrustedDevice>> {
        self.store.list_devices(user_id).await
    }
}
