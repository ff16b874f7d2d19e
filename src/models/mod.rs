// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@kernel.org>

//! Data models for the application.

pub mod connection;
pub mod mfa;
pub mod security;
pub mod session;
pub mod user;

pub use connection::{
    AppConnection, ConnectionHealthMetric, ConnectionStatus, HealthStatus, OAuthState,
};
pub use mfa::{BackupCode, MfaSetup};
pub use security::{SecurityEvent, SecurityEventType, Severity, TrustedDevice};
pub use session::{RefreshTokenRecord, Session};
pub use user::User;
