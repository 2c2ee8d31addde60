//! # Lifecycle Hooks
//!
//! Eight embedder-overridable callbacks, each invoked at exactly one
//! point in the lifecycle. The trait ships no-op default methods, so
//! an embedder implements only the slots it cares about and the
//! dispatcher never has to reason about absent hooks.
//!
//! | Hook | Called | On failure |
//! |---|---|---|
//! | `pre_bootstrap` | start of the bootstrap path in `start_api` | fatal |
//! | `post_bootstrap` | after the database bootstrap and trust refresh | fatal |
//! | `pre_join` | after trust confirmation, before the broadcasts | fatal |
//! | `post_join` | very end of the join path | fatal |
//! | `on_start` | after init, before the ready latch closes | fatal to `run` |
//! | `on_heartbeat` | each database heartbeat tick | logged |
//! | `on_new_member` | a peer's join broadcast reached us | logged |
//! | `pre_remove` / `post_remove` | around member removal | fatal to the removal |
//!
//! Hooks always receive a freshly-built [`State`], so they observe the
//! current certificate, remote list, and readiness.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::state::State;

/// Configuration map handed through `start_api` to the init hooks.
pub type InitConfig = HashMap<String, String>;

/// Embedder lifecycle callbacks. All methods default to no-ops.
#[async_trait]
pub trait Hooks: Send + Sync {
    async fn pre_bootstrap(&self, _state: &State, _init_config: &InitConfig) -> anyhow::Result<()> {
        Ok(())
    }

    async fn post_bootstrap(
        &self,
        _state: &State,
        _init_config: &InitConfig,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn pre_join(&self, _state: &State, _init_config: &InitConfig) -> anyhow::Result<()> {
        Ok(())
    }

    async fn post_join(&self, _state: &State, _init_config: &InitConfig) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_start(&self, _state: &State) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_heartbeat(&self, _state: &State) -> anyhow::Result<()> {
        Ok(())
    }

    /// Runs when a freshly-joined peer's broadcast reaches this node.
    /// `member` is the joiner's name.
    async fn on_new_member(&self, _state: &State, _member: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn pre_remove(&self, _state: &State, _force: bool) -> anyhow::Result<()> {
        Ok(())
    }

    async fn post_remove(&self, _state: &State, _force: bool) -> anyhow::Result<()> {
        Ok(())
    }
}

/// The hook set used when the embedder supplies none.
pub struct NoopHooks;

#[async_trait]
impl Hooks for NoopHooks {}
