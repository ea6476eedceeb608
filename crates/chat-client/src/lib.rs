//! Collaborator contracts and the event-loop runtime around `chat-core`.
//!
//! The [`ChatApi`] trait is the request/response surface the runtime needs
//! from the message API; [`RestChatApi`] implements it over HTTP and
//! [`InMemoryChatApi`] implements it in-process for tests and smoke runs.
//! [`ChatRuntime`] owns all conversation state on a single task and is
//! driven exclusively through channels.

/// Message API contract plus the in-memory implementation.
pub mod api;
/// REST implementation of the message API contract.
pub mod rest;
/// Channel-driven single-conversation runtime.
pub mod runtime;

pub use api::{ChatApi, FetchDirection, FetchPage, InMemoryChatApi};
pub use rest::{RestChatApi, RestChatApiConfig};
pub use runtime::{ChatRuntime, ChatRuntimeHandle, RuntimeConfig, spawn_runtime};
