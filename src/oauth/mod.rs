//! OAuth glue: a provider-agnostic `oauth2` client wrapper, the authorize
//! state blob, and token-bundle extraction.

pub mod client;
pub mod provider;
pub mod state;

pub use client::{CustomTokenFields, OauthTokenResponse, StandardOauth2Client};
pub use provider::{ProviderOauth, TokenBundle};
pub use state::{STATE_MAX_AGE_SECS, StateBlob};
