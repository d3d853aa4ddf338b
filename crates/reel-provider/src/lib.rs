//! Client for the external clip-generation provider.
//!
//! The provider turns a source video into short clips asynchronously. This
//! crate exposes the provider-agnostic [`ClipProvider`] trait, its single
//! HTTP binding and the poll/webhook wire types.

pub mod client;
pub mod error;
pub mod types;

pub use client::{ClipProvider, HttpClipProvider, ProviderConfig, API_KEY_HEADER};
pub use error::{ProviderError, ProviderResult};
pub use types::{
    ProviderStatus, QueryResponse, RawClip, SubmitRequest, SubmitResponse, WebhookPayload,
    WebhookStatus, CODE_COMPLETED, CODE_ERROR_FLOOR, CODE_PROCESSING,
};
