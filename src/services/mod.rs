// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Services module - business logic layer.

pub mod auth;
pub mod identity;
pub mod mfa;
pub mod oauth;
pub mod provider;
pub mod risk;
pub mod session;
pub mod token;
pub mod upstream;

pub use auth::{AuthService, ClientInfo, LoginOutcome, LoginRequest, RegisterRequest};
pub use identity::{HttpIdentityProvider, IdentityProvider, Introspection};
pub use mfa::{MfaEnrollment, MfaService, MfaSetupView};
pub use oauth::{ConnectStart, ConnectionSummary, HealthCheckResult, OAuthConnectionManager};
pub use provider::{HttpOAuthProvider, OAuthProvider, ProviderAccount, ProviderTokens};
pub use risk::{DeviceAssessment, NewSecurityEvent, RiskService};
pub use session::{spawn_session_reaper, SessionError, SessionManager};
pub use token::{Claims, TokenPair, TokenService};
